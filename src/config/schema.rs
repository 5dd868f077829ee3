//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::security::events::Severity;

/// Root configuration for the admission guard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Admission API listener settings.
    pub server: ServerConfig,

    /// Shared store connection settings.
    pub store: StoreConfig,

    /// Global rate limiting switches.
    pub rate_limit: RateLimitConfig,

    /// Per-action limits, keyed by action name (e.g. `pack_create`).
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, ActionLimit>,

    /// Abuse scoring policy.
    pub abuse: AbuseConfig,

    /// Security event log settings.
    pub security_log: SecurityLogConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            limits: default_limits(),
            abuse: AbuseConfig::default(),
            security_log: SecurityLogConfig::default(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8090").
    pub bind_address: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8090".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL. When absent the guard keeps all state in process.
    pub redis_url: Option<String>,

    /// Prefix applied to every key written to Redis.
    pub key_prefix: String,

    /// Upper bound for a single store round trip in milliseconds.
    pub operation_timeout_ms: u64,

    /// First delay before retrying an unreachable store.
    pub retry_base_ms: u64,

    /// Maximum delay between store retries.
    pub retry_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "legends".to_string(),
            operation_timeout_ms: 500,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
        }
    }
}

/// Strategy used to count admissions for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter reset at the end of each window.
    #[default]
    FixedWindow,
    /// Log of admissions over the trailing window.
    SlidingWindow,
    /// Bucket of `limit` tokens refilled over the window.
    TokenBucket,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting. When disabled every check is admitted.
    pub enabled: bool,

    /// Strategy for actions that do not name one.
    pub default_strategy: Strategy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: Strategy::FixedWindow,
        }
    }
}

/// Limit for a single action.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActionLimit {
    /// Maximum admissions per window.
    pub limit: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Strategy override for this action.
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

impl ActionLimit {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window_secs,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Default limits for the bot's command surface.
pub fn default_limits() -> HashMap<String, ActionLimit> {
    [
        ("pack_create", ActionLimit::new(5, 3600)),
        ("pack_open", ActionLimit::new(20, 60)),
        ("daily_claim", ActionLimit::new(2, 60)),
        ("battle", ActionLimit::new(10, 300)),
        ("trade", ActionLimit::new(10, 300)),
        ("webhook", ActionLimit::new(60, 60)),
    ]
    .into_iter()
    .map(|(name, limit)| (name.to_string(), limit))
    .collect()
}

/// Abuse scoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Score added per violation when the action has no explicit weight.
    pub violation_weight: f64,

    /// Per-action violation weights.
    pub action_weights: HashMap<String, f64>,

    /// Score at which a user is reported as suspicious.
    pub warn_threshold: f64,

    /// Score at which a user is considered abusive.
    pub block_threshold: f64,

    /// Deny every action of users at or above `block_threshold`.
    pub enforce_block: bool,

    /// Number of violation timestamps kept per user.
    pub history_limit: usize,

    /// Score removed per hour of inactivity. Zero disables decay.
    pub decay_per_hour: f64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            violation_weight: 1.0,
            action_weights: HashMap::new(),
            warn_threshold: 10.0,
            block_threshold: 25.0,
            enforce_block: false,
            history_limit: 50,
            decay_per_hour: 0.0,
        }
    }
}

/// Security event log configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityLogConfig {
    /// JSON-lines file receiving every event.
    pub path: Option<String>,

    /// Minimum severity that triggers the alert notifier.
    pub alert_severity: Severity,

    /// Number of recent events kept in memory for the admin API.
    pub recent_capacity: usize,

    /// Log a `rate_limit_exceeded` event for every denied check.
    pub log_denials: bool,
}

impl Default for SecurityLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            alert_severity: Severity::High,
            recent_capacity: 1000,
            log_denials: true,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9091".to_string(),
        }
    }
}
