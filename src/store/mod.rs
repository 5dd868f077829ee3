//! Shared state for rate limiting and abuse scoring.
//!
//! # Data Flow
//! ```text
//! RateLimiter / AbuseScorer
//!     → resilient.rs (timeout, fallback, retry backoff)
//!         → redis_store.rs (shared across bot instances, Lua scripts)
//!         → memory.rs      (process-local fallback)
//! ```
//!
//! # Design Decisions
//! - Every admission step is one atomic store operation, never get-then-set
//! - A denied step leaves the counter untouched
//! - An unreachable store degrades to local state instead of failing the request

pub mod memory;
pub mod redis_store;
pub mod resilient;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ActionLimit, Strategy};

pub use memory::{MemoryStore, RateLimitState};
pub use redis_store::RedisStore;
pub use resilient::{ResilientStore, StoreHealth};

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt store value: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A rate limit rule resolved for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule {
    pub strategy: Strategy,
    pub limit: u32,
    pub window_secs: u64,
}

impl ResolvedRule {
    pub fn from_limit(limit: &ActionLimit, default_strategy: Strategy) -> Self {
        Self {
            strategy: limit.strategy.unwrap_or(default_strategy),
            limit: limit.limit,
            window_secs: limit.window_secs,
        }
    }

    /// Window length in milliseconds, saturating on overflow.
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// Outcome of one atomic admission step.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Admissions counted against the current window or bucket.
    pub count: u32,
    pub remaining: u32,
    /// Time until the next admission is possible, set on denial.
    pub retry_after: Option<Duration>,
    /// Served from process-local state because the shared store was unreachable.
    pub degraded: bool,
}

impl Admission {
    pub fn allowed(count: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            count,
            remaining,
            retry_after: None,
            degraded: false,
        }
    }

    pub fn denied(count: u32, retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            count,
            remaining: 0,
            retry_after: Some(Duration::from_millis(u64::try_from(retry_after_ms).unwrap_or(0))),
            degraded: false,
        }
    }
}

/// Score bookkeeping parameters passed down to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorePolicy {
    pub decay_per_hour: f64,
    pub history_limit: usize,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self {
            decay_per_hour: 0.0,
            history_limit: 50,
        }
    }
}

/// Per-user abuse bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseScoreRecord {
    /// Score as of `updated_at`, before any decay since then.
    pub score: f64,
    /// Violations recorded over the lifetime of the record.
    pub total_violations: u64,
    /// Most recent violation timestamps, newest first.
    pub history: VecDeque<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AbuseScoreRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            score: 0.0,
            total_violations: 0,
            history: VecDeque::new(),
            updated_at: now,
        }
    }

    /// Score at `now` after applying linear decay.
    pub fn score_at(&self, decay_per_hour: f64, now: DateTime<Utc>) -> f64 {
        decayed(self.score, self.updated_at, decay_per_hour, now)
    }

    pub fn apply_violation(&mut self, weight: f64, policy: &ScorePolicy, now: DateTime<Utc>) {
        self.score = self.score_at(policy.decay_per_hour, now) + weight.max(0.0);
        self.total_violations += 1;
        self.history.push_front(now);
        self.history.truncate(policy.history_limit);
        self.updated_at = now;
    }

    /// Zero the score and forget the violation history.
    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.score = 0.0;
        self.history.clear();
        self.updated_at = now;
    }
}

pub(crate) fn decayed(
    score: f64,
    updated_at: DateTime<Utc>,
    decay_per_hour: f64,
    now: DateTime<Utc>,
) -> f64 {
    if decay_per_hour <= 0.0 {
        return score.max(0.0);
    }
    let elapsed_ms = (now - updated_at).num_milliseconds().max(0) as f64;
    (score - decay_per_hour * elapsed_ms / 3_600_000.0).max(0.0)
}

/// Persistence seam for admission state and abuse scores.
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Perform one atomic admission step for `key` under `rule`.
    async fn acquire(
        &self,
        key: &str,
        rule: &ResolvedRule,
        now: DateTime<Utc>,
    ) -> StoreResult<Admission>;

    /// Add `weight` to the user's score and append to its violation history.
    async fn record_violation(
        &self,
        user_id: &str,
        weight: f64,
        policy: &ScorePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<AbuseScoreRecord>;

    async fn abuse_record(&self, user_id: &str) -> StoreResult<Option<AbuseScoreRecord>>;

    /// Returns whether the user had a record.
    async fn reset_abuse(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn abuse_records(&self) -> StoreResult<Vec<(String, AbuseScoreRecord)>>;

    fn name(&self) -> &'static str;
}

/// Key under which the admission state of (user, action) lives.
pub fn rate_limit_key(action: &str, user_id: &str) -> String {
    format!("rl:{action}:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_decay_is_linear_and_floored() {
        let start = Utc::now();
        let mut record = AbuseScoreRecord::new(start);
        let policy = ScorePolicy {
            decay_per_hour: 2.0,
            history_limit: 3,
        };
        record.apply_violation(5.0, &policy, start);

        let later = start + TimeDelta::hours(1);
        assert!((record.score_at(2.0, later) - 3.0).abs() < 1e-9);
        assert_eq!(record.score_at(2.0, start + TimeDelta::hours(10)), 0.0);
        assert_eq!(record.score_at(0.0, start + TimeDelta::hours(10)), 5.0);
    }

    #[test]
    fn test_history_is_bounded_newest_first() {
        let start = Utc::now();
        let mut record = AbuseScoreRecord::new(start);
        let policy = ScorePolicy {
            decay_per_hour: 0.0,
            history_limit: 2,
        };
        for i in 0..4 {
            record.apply_violation(1.0, &policy, start + TimeDelta::seconds(i));
        }
        assert_eq!(record.total_violations, 4);
        assert_eq!(record.score, 4.0);
        assert_eq!(
            record.history,
            VecDeque::from(vec![start + TimeDelta::seconds(3), start + TimeDelta::seconds(2)])
        );

        record.clear(start);
        assert_eq!(record.score, 0.0);
        assert!(record.history.is_empty());
        assert_eq!(record.total_violations, 4);
    }

    #[test]
    fn test_window_ms_saturates() {
        let rule = ResolvedRule {
            strategy: Strategy::FixedWindow,
            limit: 1,
            window_secs: u64::MAX,
        };
        assert_eq!(rule.window_ms(), i64::MAX);
    }
}
