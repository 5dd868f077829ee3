//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GuardConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → limiter and scorer swap their settings atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Store, log sink and listener settings only apply on restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    default_limits, AbuseConfig, ActionLimit, AdminConfig, GuardConfig, ObservabilityConfig,
    RateLimitConfig, SecurityLogConfig, ServerConfig, StoreConfig, Strategy,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
