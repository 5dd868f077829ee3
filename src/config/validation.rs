//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, windows > 0, thresholds ordered)
//! - Check addresses and store URLs are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GuardConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("action name must not be empty")]
    EmptyActionName,

    #[error("limit for action `{0}` must be greater than zero")]
    ZeroLimit(String),

    #[error("window for action `{0}` must be greater than zero")]
    ZeroWindow(String),

    #[error("window for action `{0}` exceeds {max} seconds", max = MAX_WINDOW_SECS)]
    WindowTooLong(String),

    #[error("weight for `{0}` must be a positive number")]
    InvalidWeight(String),

    #[error("abuse threshold `{0}` must be a non-negative number")]
    InvalidThreshold(&'static str),

    #[error("warn_threshold ({warn}) must not exceed block_threshold ({block})")]
    ThresholdOrder { warn: f64, block: f64 },

    #[error("decay_per_hour must be a non-negative number")]
    InvalidDecay,

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("redis_url `{0}` must use the redis:// or rediss:// scheme")]
    InvalidRedisUrl(String),

    #[error("`{field}` is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },
}

/// Longest window accepted for an action (one year).
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 3600;

fn valid_number(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn positive_number(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut actions: Vec<_> = config.limits.iter().collect();
    actions.sort_by(|a, b| a.0.cmp(b.0));
    for (action, limit) in actions {
        if action.trim().is_empty() {
            errors.push(ValidationError::EmptyActionName);
            continue;
        }
        if limit.limit == 0 {
            errors.push(ValidationError::ZeroLimit(action.clone()));
        }
        if limit.window_secs == 0 {
            errors.push(ValidationError::ZeroWindow(action.clone()));
        } else if limit.window_secs > MAX_WINDOW_SECS {
            errors.push(ValidationError::WindowTooLong(action.clone()));
        }
    }

    let abuse = &config.abuse;
    if !positive_number(abuse.violation_weight) {
        errors.push(ValidationError::InvalidWeight("violation_weight".to_string()));
    }
    let mut weights: Vec<_> = abuse.action_weights.iter().collect();
    weights.sort_by(|a, b| a.0.cmp(b.0));
    for (action, weight) in weights {
        if !positive_number(*weight) {
            errors.push(ValidationError::InvalidWeight(action.clone()));
        }
    }
    if !valid_number(abuse.warn_threshold) {
        errors.push(ValidationError::InvalidThreshold("warn_threshold"));
    }
    if !valid_number(abuse.block_threshold) {
        errors.push(ValidationError::InvalidThreshold("block_threshold"));
    }
    if abuse.warn_threshold > abuse.block_threshold {
        errors.push(ValidationError::ThresholdOrder {
            warn: abuse.warn_threshold,
            block: abuse.block_threshold,
        });
    }
    if !valid_number(abuse.decay_per_hour) {
        errors.push(ValidationError::InvalidDecay);
    }
    if abuse.history_limit == 0 {
        errors.push(ValidationError::ZeroValue("abuse.history_limit"));
    }

    if config.security_log.recent_capacity == 0 {
        errors.push(ValidationError::ZeroValue("security_log.recent_capacity"));
    }

    if let Some(url) = &config.store.redis_url {
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            errors.push(ValidationError::InvalidRedisUrl(url.clone()));
        }
    }
    if config.store.operation_timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue("store.operation_timeout_ms"));
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::ZeroValue("server.request_timeout_secs"));
    }

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "server.bind_address",
            value: config.server.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ActionLimit;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GuardConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GuardConfig::default();
        config.limits.insert("trade".into(), ActionLimit::new(0, 0));
        config.abuse.warn_threshold = 50.0;
        config.abuse.decay_per_hour = -1.0;
        config.store.redis_url = Some("http://cache:6379".into());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroLimit("trade".into()),
                ValidationError::ZeroWindow("trade".into()),
                ValidationError::ThresholdOrder { warn: 50.0, block: 25.0 },
                ValidationError::InvalidDecay,
                ValidationError::InvalidRedisUrl("http://cache:6379".into()),
            ]
        );
    }

    #[test]
    fn test_rejects_bad_addresses_and_weights() {
        let mut config = GuardConfig::default();
        config.server.bind_address = "not-an-address".into();
        config.abuse.action_weights.insert("battle".into(), f64::NAN);

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::InvalidWeight("battle".into())));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidAddress { field: "server.bind_address", .. })));
    }

    #[test]
    fn test_zero_weights_are_rejected() {
        let mut config = GuardConfig::default();
        config.abuse.violation_weight = 0.0;
        config.abuse.action_weights.insert("trade".into(), 0.0);
        config.abuse.action_weights.insert("battle".into(), 0.5);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::InvalidWeight("violation_weight".into()),
                ValidationError::InvalidWeight("trade".into()),
            ]
        );
    }
}
