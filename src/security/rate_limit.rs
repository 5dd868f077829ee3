//! Per-user, per-action rate limiting.
//!
//! Each check is one atomic step against the store under the rule configured
//! for the action. Denied checks are reported to the [`AbuseScorer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::config::{ActionLimit, GuardConfig, Strategy};
use crate::observability::metrics;
use crate::security::abuse::AbuseScorer;
use crate::store::{rate_limit_key, GuardStore, ResolvedRule};

/// Metric label shared by actions without a configured limit.
const UNKNOWN_ACTION: &str = "unknown";

/// Runtime view of the rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub default_strategy: Strategy,
    pub limits: HashMap<String, ActionLimit>,
}

impl RateLimitSettings {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            enabled: config.rate_limit.enabled,
            default_strategy: config.rate_limit.default_strategy,
            limits: config.limits.clone(),
        }
    }

    pub fn rule_for(&self, action: &str) -> Option<ResolvedRule> {
        self.limits
            .get(action)
            .map(|limit| ResolvedRule::from_limit(limit, self.default_strategy))
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

/// Result of one rate limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub user_id: String,
    pub action: String,
    /// `None` when no limit applies (unknown action or limiting disabled).
    pub strategy: Option<Strategy>,
    pub limit: Option<u32>,
    pub window_secs: Option<u64>,
    pub count: u32,
    pub remaining: Option<u32>,
    #[serde(rename = "retry_after_secs", serialize_with = "serialize_ceil_secs")]
    pub retry_after: Option<Duration>,
    /// Decided from process-local state because the shared store was unreachable.
    pub degraded: bool,
    /// Score after this check, set when the check was denied.
    pub abuse_score: Option<f64>,
}

impl RateLimitDecision {
    fn unlimited(user_id: &str, action: &str) -> Self {
        Self {
            allowed: true,
            user_id: user_id.to_string(),
            action: action.to_string(),
            strategy: None,
            limit: None,
            window_secs: None,
            count: 0,
            remaining: None,
            retry_after: None,
            degraded: false,
            abuse_score: None,
        }
    }

    /// Whole seconds until retry, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn serialize_ceil_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&ceil_secs(*duration)),
        None => serializer.serialize_none(),
    }
}

pub struct RateLimiter {
    store: Arc<dyn GuardStore>,
    scorer: Arc<AbuseScorer>,
    settings: ArcSwap<RateLimitSettings>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn GuardStore>, scorer: Arc<AbuseScorer>, settings: RateLimitSettings) -> Self {
        Self {
            store,
            scorer,
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.load_full()
    }

    /// Swap in new limits. Counters already in the store are kept.
    pub fn update_settings(&self, settings: RateLimitSettings) {
        tracing::info!(
            enabled = settings.enabled,
            actions = settings.limits.len(),
            "Rate limit settings updated"
        );
        self.settings.store(Arc::new(settings));
    }

    /// Label used for per-action metrics.
    pub fn action_label<'a>(&self, action: &'a str) -> &'a str {
        if self.settings.load().limits.contains_key(action) {
            action
        } else {
            UNKNOWN_ACTION
        }
    }

    pub async fn check_rate_limit(&self, user_id: &str, action: &str) -> RateLimitDecision {
        self.check_rate_limit_at(user_id, action, Utc::now()).await
    }

    pub async fn check_rate_limit_at(&self, user_id: &str, action: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let settings = self.settings.load_full();
        if !settings.enabled {
            return RateLimitDecision::unlimited(user_id, action);
        }

        let Some(rule) = settings.rule_for(action) else {
            tracing::warn!(user_id, action, "No rate limit configured for action, allowing");
            metrics::record_admission(UNKNOWN_ACTION, "unlimited");
            return RateLimitDecision::unlimited(user_id, action);
        };

        let key = rate_limit_key(action, user_id);
        let admission = match self.store.acquire(&key, &rule, now).await {
            Ok(admission) => admission,
            Err(error) => {
                // Fail open: the store is never a reason to refuse a user.
                tracing::error!(user_id, action, error = %error, "Rate limit check failed, allowing");
                metrics::record_admission(action, "allowed");
                return RateLimitDecision {
                    strategy: Some(rule.strategy),
                    limit: Some(rule.limit),
                    window_secs: Some(rule.window_secs),
                    degraded: true,
                    ..RateLimitDecision::unlimited(user_id, action)
                };
            }
        };

        let mut decision = RateLimitDecision {
            allowed: admission.allowed,
            user_id: user_id.to_string(),
            action: action.to_string(),
            strategy: Some(rule.strategy),
            limit: Some(rule.limit),
            window_secs: Some(rule.window_secs),
            count: admission.count,
            remaining: Some(admission.remaining),
            retry_after: admission.retry_after,
            degraded: admission.degraded,
            abuse_score: None,
        };

        if decision.allowed {
            metrics::record_admission(action, "allowed");
            tracing::debug!(
                user_id,
                action,
                count = decision.count,
                remaining = admission.remaining,
                strategy = %rule.strategy,
                "Rate limit check passed"
            );
        } else {
            metrics::record_admission(action, "denied");
            let score = self.scorer.record_violation_at(user_id, action, now).await;
            decision.abuse_score = Some(score);
            tracing::warn!(
                user_id,
                action,
                count = decision.count,
                limit = rule.limit,
                retry_after = ?decision.retry_after,
                abuse_score = score,
                degraded = decision.degraded,
                "Rate limit exceeded"
            );
        }

        decision
    }
}
