//! Process-local store.
//!
//! Used directly when no shared store is configured and as the fallback
//! while the shared store is unreachable. State is not visible to other
//! bot instances.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::Strategy;
use crate::store::{
    AbuseScoreRecord, Admission, GuardStore, ResolvedRule, ScorePolicy, StoreResult,
};

/// Admission state for one (user, action) key.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub strategy: Strategy,
    /// Fixed window counter, or admissions currently in the sliding log.
    pub count: u32,
    /// Token bucket fill level.
    pub tokens: f64,
    pub window_start: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    window_ms: i64,
    hits: VecDeque<DateTime<Utc>>,
}

impl RateLimitState {
    pub fn new(rule: &ResolvedRule, now: DateTime<Utc>) -> Self {
        Self {
            strategy: rule.strategy,
            count: 0,
            tokens: f64::from(rule.limit),
            window_start: now,
            last_update: now,
            window_ms: rule.window_ms(),
            hits: VecDeque::new(),
        }
    }

    /// Run one admission step against this state.
    pub fn acquire(&mut self, rule: &ResolvedRule, now: DateTime<Utc>) -> Admission {
        if self.strategy != rule.strategy {
            *self = Self::new(rule, now);
        }
        self.window_ms = rule.window_ms();

        let admission = match rule.strategy {
            Strategy::FixedWindow => self.acquire_fixed(rule, now),
            Strategy::SlidingWindow => self.acquire_sliding(rule, now),
            Strategy::TokenBucket => self.acquire_bucket(rule, now),
        };
        self.last_update = now;
        admission
    }

    fn acquire_fixed(&mut self, rule: &ResolvedRule, now: DateTime<Utc>) -> Admission {
        let window_ms = rule.window_ms();
        if elapsed_ms(self.window_start, now) >= window_ms {
            self.count = 0;
            self.window_start = now;
        }

        if self.count < rule.limit {
            self.count += 1;
            Admission::allowed(self.count, rule.limit - self.count)
        } else {
            let retry = window_ms - elapsed_ms(self.window_start, now);
            Admission::denied(self.count, retry)
        }
    }

    fn acquire_sliding(&mut self, rule: &ResolvedRule, now: DateTime<Utc>) -> Admission {
        let window_ms = rule.window_ms();
        while let Some(oldest) = self.hits.front() {
            if elapsed_ms(*oldest, now) >= window_ms {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        let in_window = u32::try_from(self.hits.len()).unwrap_or(u32::MAX);
        if in_window < rule.limit {
            self.hits.push_back(now);
            self.count = in_window + 1;
            self.window_start = self.hits.front().copied().unwrap_or(now);
            Admission::allowed(self.count, rule.limit - self.count)
        } else {
            self.count = in_window;
            let retry = self
                .hits
                .front()
                .map(|oldest| window_ms - elapsed_ms(*oldest, now))
                .unwrap_or(window_ms);
            Admission::denied(self.count, retry)
        }
    }

    fn acquire_bucket(&mut self, rule: &ResolvedRule, now: DateTime<Utc>) -> Admission {
        let capacity = f64::from(rule.limit);
        let rate_per_ms = capacity / rule.window_ms() as f64;
        let elapsed = elapsed_ms(self.last_update, now) as f64;

        self.tokens = (self.tokens + elapsed * rate_per_ms).min(capacity);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            let remaining = self.tokens.floor() as u32;
            self.count = rule.limit - remaining;
            Admission::allowed(self.count, remaining)
        } else {
            self.count = rule.limit;
            let retry = ((1.0 - self.tokens) / rate_per_ms).ceil() as i64;
            Admission::denied(self.count, retry)
        }
    }

    /// Whether the state carries nothing a future check could observe.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        elapsed_ms(self.last_update, now) >= self.window_ms
    }
}

/// Absorbs float error from refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds().max(0)
}

/// In-memory implementation of [`GuardStore`].
#[derive(Default)]
pub struct MemoryStore {
    limits: DashMap<String, RateLimitState>,
    abuse: DashMap<String, AbuseScoreRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop admission states whose window has fully elapsed.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.limits.len();
        self.limits.retain(|_, state| !state.is_idle(now));
        before.saturating_sub(self.limits.len())
    }

    /// Snapshot of the admission state for `key`.
    pub fn state(&self, key: &str) -> Option<RateLimitState> {
        self.limits.get(key).map(|r| r.value().clone())
    }

    pub fn tracked_keys(&self) -> usize {
        self.limits.len()
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn acquire(
        &self,
        key: &str,
        rule: &ResolvedRule,
        now: DateTime<Utc>,
    ) -> StoreResult<Admission> {
        // The entry guard holds the shard lock for the whole step.
        let mut state = self
            .limits
            .entry(key.to_string())
            .or_insert_with(|| RateLimitState::new(rule, now));
        Ok(state.acquire(rule, now))
    }

    async fn record_violation(
        &self,
        user_id: &str,
        weight: f64,
        policy: &ScorePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<AbuseScoreRecord> {
        let mut record = self
            .abuse
            .entry(user_id.to_string())
            .or_insert_with(|| AbuseScoreRecord::new(now));
        record.apply_violation(weight, policy, now);
        Ok(record.value().clone())
    }

    async fn abuse_record(&self, user_id: &str) -> StoreResult<Option<AbuseScoreRecord>> {
        Ok(self.abuse.get(user_id).map(|r| r.value().clone()))
    }

    async fn reset_abuse(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        match self.abuse.get_mut(user_id) {
            Some(mut record) => {
                record.clear(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn abuse_records(&self) -> StoreResult<Vec<(String, AbuseScoreRecord)>> {
        Ok(self
            .abuse
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use std::time::Duration;

    fn secs(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        now + TimeDelta::seconds(secs)
    }

    fn rule(strategy: Strategy, limit: u32, window_secs: u64) -> ResolvedRule {
        ResolvedRule {
            strategy,
            limit,
            window_secs,
        }
    }

    async fn run(store: &MemoryStore, rule: &ResolvedRule, now: DateTime<Utc>, n: usize) -> Vec<bool> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(store.acquire("rl:k:u", rule, now).await.unwrap().allowed);
        }
        out
    }

    #[tokio::test]
    async fn test_fixed_window_limit_and_reset() {
        let store = MemoryStore::new();
        let r = rule(Strategy::FixedWindow, 5, 3600);
        let t0 = Utc::now();

        assert_eq!(run(&store, &r, t0, 6).await, vec![true, true, true, true, true, false]);

        let denied = store.acquire("rl:k:u", &r, secs(t0, 600)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 5);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(3000)));

        let fresh = store.acquire("rl:k:u", &r, secs(t0, 3600)).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.remaining, 4);
    }

    #[tokio::test]
    async fn test_sliding_window_frees_oldest_slot() {
        let store = MemoryStore::new();
        let r = rule(Strategy::SlidingWindow, 2, 60);
        let t0 = Utc::now();

        assert!(store.acquire("rl:k:u", &r, t0).await.unwrap().allowed);
        assert!(store.acquire("rl:k:u", &r, secs(t0, 30)).await.unwrap().allowed);

        let denied = store.acquire("rl:k:u", &r, secs(t0, 45)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(15)));

        // The first hit has left the window, the second has not.
        assert!(store.acquire("rl:k:u", &r, secs(t0, 60)).await.unwrap().allowed);
        assert!(!store.acquire("rl:k:u", &r, secs(t0, 61)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_refills_over_window() {
        let store = MemoryStore::new();
        let r = rule(Strategy::TokenBucket, 4, 60);
        let t0 = Utc::now();

        assert_eq!(run(&store, &r, t0, 5).await, vec![true, true, true, true, false]);

        // One token every 15 seconds.
        let denied = store.acquire("rl:k:u", &r, secs(t0, 10)).await.unwrap();
        assert!(!denied.allowed);
        let retry = denied.retry_after.unwrap().as_secs_f64();
        assert!((retry - 5.0).abs() < 0.01, "retry after {retry}s");
        assert!(store.acquire("rl:k:u", &r, secs(t0, 15)).await.unwrap().allowed);

        let refilled = run(&store, &r, secs(t0, 100), 5).await;
        assert_eq!(refilled, vec![true, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_strategy_change_resets_state() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let fixed = rule(Strategy::FixedWindow, 1, 60);
        assert!(store.acquire("rl:k:u", &fixed, t0).await.unwrap().allowed);
        assert!(!store.acquire("rl:k:u", &fixed, t0).await.unwrap().allowed);

        let bucket = rule(Strategy::TokenBucket, 1, 60);
        assert!(store.acquire("rl:k:u", &bucket, t0).await.unwrap().allowed);
        assert_eq!(store.state("rl:k:u").unwrap().strategy, Strategy::TokenBucket);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let store = Arc::new(MemoryStore::new());
        let r = rule(Strategy::FixedWindow, 7, 3600);
        let now = Utc::now();

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.acquire("rl:pack_create:42", &r, now).await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 7);
    }

    #[tokio::test]
    async fn test_purge_idle_states() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.acquire("rl:a:1", &rule(Strategy::FixedWindow, 1, 10), t0).await.unwrap();
        store.acquire("rl:b:1", &rule(Strategy::FixedWindow, 1, 100), t0).await.unwrap();

        assert_eq!(store.purge_idle(secs(t0, 50)), 1);
        assert!(store.state("rl:a:1").is_none());
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_abuse_reset_keeps_lifetime_total() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let policy = ScorePolicy::default();

        assert!(!store.reset_abuse("42", now).await.unwrap());
        store.record_violation("42", 1.5, &policy, now).await.unwrap();
        let record = store.record_violation("42", 1.5, &policy, now).await.unwrap();
        assert_eq!(record.score, 3.0);

        assert!(store.reset_abuse("42", now).await.unwrap());
        let record = store.abuse_record("42").await.unwrap().unwrap();
        assert_eq!(record.score, 0.0);
        assert!(record.history.is_empty());
        assert_eq!(record.total_violations, 2);
        assert_eq!(store.abuse_records().await.unwrap().len(), 1);
    }
}
