//! Fail-open wrapper around the shared store.
//!
//! # State Transitions
//! ```text
//! Healthy → Degraded: a primary call errors or exceeds the operation timeout
//! Degraded → Healthy: the first primary call that succeeds after the backoff
//! ```
//!
//! While degraded every call is served from the local [`MemoryStore`]; the
//! primary is only tried again once the backoff delay has passed. Abuse resets
//! that could not reach the primary are queued and replayed before the primary
//! serves anything else.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::store::{
    AbuseScoreRecord, Admission, GuardStore, MemoryStore, RedisStore, ResolvedRule, ScorePolicy,
    StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct FallbackState {
    degraded: bool,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

/// Snapshot of the store's availability for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Abuse resets waiting for the primary to come back.
    pub pending_resets: usize,
}

/// A [`GuardStore`] that never fails because of the shared store.
pub struct ResilientStore {
    primary: Option<Arc<dyn GuardStore>>,
    local: Arc<MemoryStore>,
    timeout: Duration,
    retry_base_ms: u64,
    retry_max_ms: u64,
    state: Mutex<FallbackState>,
    pending_resets: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ResilientStore {
    pub fn new(primary: Option<Arc<dyn GuardStore>>, config: &StoreConfig) -> Self {
        Self {
            primary,
            local: Arc::new(MemoryStore::new()),
            timeout: Duration::from_millis(config.operation_timeout_ms),
            retry_base_ms: config.retry_base_ms,
            retry_max_ms: config.retry_max_ms,
            state: Mutex::new(FallbackState::default()),
            pending_resets: Mutex::new(HashMap::new()),
        }
    }

    /// Memory-only store; nothing is shared across instances.
    pub fn local_only(config: &StoreConfig) -> Self {
        Self::new(None, config)
    }

    /// Build the store described by `config`, with Redis as primary when set.
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let primary: Option<Arc<dyn GuardStore>> = match &config.redis_url {
            Some(url) => Some(Arc::new(RedisStore::open(url, config.key_prefix.clone())?)),
            None => None,
        };
        Ok(Self::new(primary, config))
    }

    /// The process-local state, also used for periodic purging.
    pub fn local(&self) -> &Arc<MemoryStore> {
        &self.local
    }

    pub fn is_degraded(&self) -> bool {
        self.lock_state().degraded
    }

    pub fn health(&self) -> StoreHealth {
        let state = self.lock_state();
        StoreHealth {
            backend: self.name(),
            degraded: state.degraded,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            pending_resets: self.lock_pending().len(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FallbackState> {
        // Poisoning only means another caller panicked mid-update; the flags stay usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.pending_resets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The primary store, unless it is absent, still backing off, or has
    /// queued resets it cannot accept yet.
    async fn available_primary(&self) -> Option<Arc<dyn GuardStore>> {
        let primary = self.primary.as_ref()?;
        {
            let state = self.lock_state();
            if matches!(state.retry_at, Some(retry_at) if Instant::now() < retry_at) {
                return None;
            }
        }
        if self.replay_resets(primary).await {
            Some(primary.clone())
        } else {
            None
        }
    }

    /// Apply queued resets to the primary. Returns false if it failed again.
    async fn replay_resets(&self, primary: &Arc<dyn GuardStore>) -> bool {
        let pending = std::mem::take(&mut *self.lock_pending());
        if pending.is_empty() {
            return true;
        }

        let mut remaining = pending.into_iter();
        while let Some((user_id, at)) = remaining.next() {
            if self.guarded("reset_abuse", primary.reset_abuse(&user_id, at)).await.is_none() {
                let mut queue = self.lock_pending();
                for (user_id, at) in std::iter::once((user_id, at)).chain(remaining) {
                    // A newer reset queued meanwhile wins.
                    queue.entry(user_id).or_insert(at);
                }
                return false;
            }
            tracing::info!(user_id = %user_id, "Replayed queued abuse reset");
        }
        true
    }

    /// Run a primary call under the operation timeout, tracking its outcome.
    async fn guarded<T, F>(&self, op: &'static str, call: F) -> Option<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        match result {
            Ok(value) => {
                self.mark_healthy();
                Some(value)
            }
            Err(error) => {
                self.mark_failed(op, &error);
                None
            }
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.lock_state();
        if state.degraded {
            tracing::info!(
                failures = state.consecutive_failures,
                "Shared store reachable again, leaving fallback mode"
            );
            metrics::set_store_degraded(false);
        }
        *state = FallbackState::default();
    }

    fn mark_failed(&self, op: &'static str, error: &StoreError) {
        let mut state = self.lock_state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = calculate_backoff(
            state.consecutive_failures,
            self.retry_base_ms,
            self.retry_max_ms,
        );
        state.retry_at = Some(Instant::now() + delay);
        state.last_error = Some(error.to_string());

        if !state.degraded {
            state.degraded = true;
            metrics::set_store_degraded(true);
            tracing::warn!(
                op,
                error = %error,
                retry_in = ?delay,
                "Shared store unavailable, serving from local fallback"
            );
        } else {
            tracing::debug!(op, error = %error, retry_in = ?delay, "Shared store still unavailable");
        }
    }

    fn note_fallback(&self, op: &'static str) -> bool {
        if self.primary.is_some() {
            metrics::record_store_fallback(op);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl GuardStore for ResilientStore {
    async fn acquire(
        &self,
        key: &str,
        rule: &ResolvedRule,
        now: DateTime<Utc>,
    ) -> StoreResult<Admission> {
        if let Some(primary) = self.available_primary().await {
            if let Some(admission) = self.guarded("acquire", primary.acquire(key, rule, now)).await {
                return Ok(admission);
            }
        }
        let mut admission = self.local.acquire(key, rule, now).await?;
        admission.degraded = self.note_fallback("acquire");
        Ok(admission)
    }

    async fn record_violation(
        &self,
        user_id: &str,
        weight: f64,
        policy: &ScorePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<AbuseScoreRecord> {
        if let Some(primary) = self.available_primary().await {
            let call = primary.record_violation(user_id, weight, policy, now);
            if let Some(record) = self.guarded("record_violation", call).await {
                return Ok(record);
            }
        }
        self.note_fallback("record_violation");
        self.local.record_violation(user_id, weight, policy, now).await
    }

    async fn abuse_record(&self, user_id: &str) -> StoreResult<Option<AbuseScoreRecord>> {
        if let Some(primary) = self.available_primary().await {
            if let Some(record) = self.guarded("abuse_record", primary.abuse_record(user_id)).await {
                return Ok(record);
            }
        }
        self.note_fallback("abuse_record");
        self.local.abuse_record(user_id).await
    }

    /// Clears local and primary state. When the primary is unreachable the
    /// reset is queued, and the call reports true since it will be applied.
    async fn reset_abuse(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        // Local state may hold violations recorded while degraded; clear both.
        let local = self.local.reset_abuse(user_id, now).await?;
        if let Some(primary) = self.available_primary().await {
            if let Some(existed) = self.guarded("reset_abuse", primary.reset_abuse(user_id, now)).await
            {
                return Ok(existed || local);
            }
        }
        if !self.note_fallback("reset_abuse") {
            return Ok(local);
        }
        tracing::warn!(user_id, "Shared store unavailable, abuse reset queued");
        self.lock_pending().insert(user_id.to_string(), now);
        Ok(true)
    }

    async fn abuse_records(&self) -> StoreResult<Vec<(String, AbuseScoreRecord)>> {
        if let Some(primary) = self.available_primary().await {
            if let Some(records) = self.guarded("abuse_records", primary.abuse_records()).await {
                return Ok(records);
            }
        }
        self.note_fallback("abuse_records");
        self.local.abuse_records().await
    }

    fn name(&self) -> &'static str {
        match &self.primary {
            Some(primary) => primary.name(),
            None => self.local.name(),
        }
    }
}
