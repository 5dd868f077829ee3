//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Command invocation:
//!     → guard.rs (wraps the handler)
//!         → rate_limit.rs (per-user, per-action limits)
//!         → abuse.rs (score bump on every denial)
//!         → events.rs (structured security events, alerts)
//!     → Handler, only when admitted
//! ```
//!
//! # Design Decisions
//! - Fail open: store outages never refuse a user
//! - Denials never consume quota
//! - Event logging never fails the request path

pub mod abuse;
pub mod events;
pub mod guard;
pub mod rate_limit;

pub use abuse::{AbuseLevel, AbuseReport, AbuseScorer, AbuseSettings, UserAbuseSummary};
pub use events::{
    AlertNotifier, EventSink, JsonLinesSink, LogNotifier, LoggerHealth, SecurityEvent,
    SecurityEventLogger, Severity, SinkError, TracingSink,
};
pub use guard::{command_guard, CommandGuard, Denial, DenialReason, Guard, GuardOutcome, GuardSettings};
pub use rate_limit::{RateLimitDecision, RateLimitSettings, RateLimiter};
