//! Admission guard for the Music Legends bot.
//!
//! Decides whether a user may run a command right now, scores repeat
//! offenders and keeps a structured log of security events.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod store;

pub use config::schema::GuardConfig;
pub use http::{AppState, GuardServer};
pub use lifecycle::Shutdown;
pub use security::{Guard, GuardOutcome, RateLimitDecision, RateLimiter};
