//! Per-user abuse scoring.
//!
//! Every denied admission adds a weighted amount to the user's score.
//! Scores only go down through an admin reset, or through linear decay when
//! `decay_per_hour` is configured.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AbuseConfig;
use crate::observability::metrics;
use crate::store::{AbuseScoreRecord, GuardStore, ScorePolicy};

/// Number of users listed in the report's top offenders.
const TOP_OFFENDERS: usize = 10;

/// Runtime view of [`AbuseConfig`].
#[derive(Debug, Clone)]
pub struct AbuseSettings {
    pub violation_weight: f64,
    pub action_weights: HashMap<String, f64>,
    pub warn_threshold: f64,
    pub block_threshold: f64,
    pub enforce_block: bool,
    pub policy: ScorePolicy,
}

impl From<&AbuseConfig> for AbuseSettings {
    fn from(config: &AbuseConfig) -> Self {
        Self {
            violation_weight: config.violation_weight,
            action_weights: config.action_weights.clone(),
            warn_threshold: config.warn_threshold,
            block_threshold: config.block_threshold,
            enforce_block: config.enforce_block,
            policy: ScorePolicy {
                decay_per_hour: config.decay_per_hour,
                history_limit: config.history_limit,
            },
        }
    }
}

impl Default for AbuseSettings {
    fn default() -> Self {
        Self::from(&AbuseConfig::default())
    }
}

/// Coarse classification of a score against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseLevel {
    Normal,
    Suspicious,
    Abusive,
}

/// Admin view of one user's record.
#[derive(Debug, Clone, Serialize)]
pub struct UserAbuseSummary {
    pub user_id: String,
    pub score: f64,
    pub level: AbuseLevel,
    pub total_violations: u64,
    pub recent_violations: Vec<DateTime<Utc>>,
    pub last_violation: Option<DateTime<Utc>>,
}

/// Aggregate counts for the admin report command.
#[derive(Debug, Clone, Serialize)]
pub struct AbuseReport {
    pub tracked_users: usize,
    pub users_above_warn: usize,
    pub users_above_block: usize,
    pub total_violations: u64,
    pub warn_threshold: f64,
    pub block_threshold: f64,
    pub top_offenders: Vec<UserAbuseSummary>,
}

/// Accumulates and exposes per-user abuse scores.
pub struct AbuseScorer {
    store: Arc<dyn GuardStore>,
    settings: ArcSwap<AbuseSettings>,
}

impl AbuseScorer {
    pub fn new(store: Arc<dyn GuardStore>, settings: AbuseSettings) -> Self {
        Self {
            store,
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn settings(&self) -> Arc<AbuseSettings> {
        self.settings.load_full()
    }

    pub fn update_settings(&self, settings: AbuseSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Weight added to a score when `action` is denied.
    pub fn weight_for(&self, action: &str) -> f64 {
        let settings = self.settings.load();
        settings
            .action_weights
            .get(action)
            .copied()
            .unwrap_or(settings.violation_weight)
    }

    pub fn classify(&self, score: f64) -> AbuseLevel {
        let settings = self.settings.load();
        if score >= settings.block_threshold {
            AbuseLevel::Abusive
        } else if score >= settings.warn_threshold {
            AbuseLevel::Suspicious
        } else {
            AbuseLevel::Normal
        }
    }

    /// Record a denied `action` against `user_id`; returns the new score.
    pub async fn record_violation(&self, user_id: &str, action: &str) -> f64 {
        self.record_violation_at(user_id, action, Utc::now()).await
    }

    pub async fn record_violation_at(&self, user_id: &str, action: &str, now: DateTime<Utc>) -> f64 {
        let weight = self.weight_for(action);
        let policy = self.settings.load().policy;
        metrics::record_violation(action);

        match self.store.record_violation(user_id, weight, &policy, now).await {
            Ok(record) => record.score,
            Err(error) => {
                tracing::error!(user_id, action, error = %error, "Failed to record violation");
                0.0
            }
        }
    }

    pub async fn get_record(&self, user_id: &str) -> Option<AbuseScoreRecord> {
        match self.store.abuse_record(user_id).await {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(user_id, error = %error, "Failed to read abuse record");
                None
            }
        }
    }

    /// Current score, 0.0 for users without violations.
    pub async fn get_abuse_score(&self, user_id: &str) -> f64 {
        self.get_abuse_score_at(user_id, Utc::now()).await
    }

    pub async fn get_abuse_score_at(&self, user_id: &str, now: DateTime<Utc>) -> f64 {
        let decay = self.settings.load().policy.decay_per_hour;
        self.get_record(user_id)
            .await
            .map(|record| record.score_at(decay, now))
            .unwrap_or(0.0)
    }

    pub async fn summary(&self, user_id: &str) -> Option<UserAbuseSummary> {
        let record = self.get_record(user_id).await?;
        Some(self.summarize(user_id.to_string(), &record, Utc::now()))
    }

    fn summarize(&self, user_id: String, record: &AbuseScoreRecord, now: DateTime<Utc>) -> UserAbuseSummary {
        let score = record.score_at(self.settings.load().policy.decay_per_hour, now);
        UserAbuseSummary {
            user_id,
            score,
            level: self.classify(score),
            total_violations: record.total_violations,
            recent_violations: record.history.iter().copied().collect(),
            last_violation: record.history.front().copied(),
        }
    }

    /// Zero the user's score and clear its history.
    ///
    /// Returns whether the user had a record, or true when the reset is queued
    /// for a shared store that is currently unreachable.
    pub async fn reset_abuse_score(&self, user_id: &str) -> bool {
        match self.store.reset_abuse(user_id, Utc::now()).await {
            Ok(existed) => {
                tracing::info!(user_id, existed, "Abuse score reset");
                existed
            }
            Err(error) => {
                tracing::error!(user_id, error = %error, "Failed to reset abuse score");
                false
            }
        }
    }

    /// Whether the user has reached the block threshold.
    pub async fn is_blocked(&self, user_id: &str) -> bool {
        let threshold = self.settings.load().block_threshold;
        self.get_abuse_score(user_id).await >= threshold
    }

    pub async fn report(&self) -> AbuseReport {
        self.report_at(Utc::now()).await
    }

    pub async fn report_at(&self, now: DateTime<Utc>) -> AbuseReport {
        let settings = self.settings.load_full();
        let records = match self.store.abuse_records().await {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(error = %error, "Failed to list abuse records");
                Vec::new()
            }
        };

        let mut summaries: Vec<UserAbuseSummary> = records
            .into_iter()
            .map(|(user_id, record)| self.summarize(user_id, &record, now))
            .collect();

        let report = AbuseReport {
            tracked_users: summaries.len(),
            users_above_warn: summaries
                .iter()
                .filter(|s| s.score >= settings.warn_threshold)
                .count(),
            users_above_block: summaries
                .iter()
                .filter(|s| s.score >= settings.block_threshold)
                .count(),
            total_violations: summaries.iter().map(|s| s.total_violations).sum(),
            warn_threshold: settings.warn_threshold,
            block_threshold: settings.block_threshold,
            top_offenders: Vec::new(),
        };

        summaries.retain(|s| s.score > 0.0);
        summaries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.user_id.cmp(&b.user_id)));
        summaries.truncate(TOP_OFFENDERS);

        AbuseReport {
            top_offenders: summaries,
            ..report
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeDelta;

    fn scorer(settings: AbuseSettings) -> AbuseScorer {
        AbuseScorer::new(Arc::new(MemoryStore::new()), settings)
    }

    #[tokio::test]
    async fn test_violation_increments_and_reset_zeroes() {
        let scorer = scorer(AbuseSettings::default());

        assert_eq!(scorer.get_abuse_score("42").await, 0.0);
        assert_eq!(scorer.record_violation("42", "pack_create").await, 1.0);
        assert_eq!(scorer.record_violation("42", "pack_create").await, 2.0);
        assert_eq!(scorer.get_abuse_score("42").await, 2.0);

        assert!(scorer.reset_abuse_score("42").await);
        assert_eq!(scorer.get_abuse_score("42").await, 0.0);
        assert!(scorer.get_record("42").await.unwrap().history.is_empty());
        assert!(!scorer.reset_abuse_score("unknown").await);
    }

    #[tokio::test]
    async fn test_action_weights_and_classification() {
        let mut settings = AbuseSettings::default();
        settings.action_weights.insert("trade".into(), 6.0);
        let scorer = scorer(settings);

        assert_eq!(scorer.weight_for("trade"), 6.0);
        assert_eq!(scorer.weight_for("battle"), 1.0);

        scorer.record_violation("7", "trade").await;
        scorer.record_violation("7", "trade").await;
        assert_eq!(scorer.classify(scorer.get_abuse_score("7").await), AbuseLevel::Suspicious);
        assert!(!scorer.is_blocked("7").await);

        for _ in 0..3 {
            scorer.record_violation("7", "trade").await;
        }
        assert_eq!(scorer.get_abuse_score("7").await, 30.0);
        assert!(scorer.is_blocked("7").await);
    }

    #[tokio::test]
    async fn test_decay_when_configured() {
        let mut settings = AbuseSettings::default();
        settings.policy.decay_per_hour = 1.0;
        let scorer = scorer(settings);
        let t0 = Utc::now();

        scorer.record_violation_at("9", "battle", t0).await;
        scorer.record_violation_at("9", "battle", t0).await;
        scorer.record_violation_at("9", "battle", t0).await;

        let score = scorer.get_abuse_score_at("9", t0 + TimeDelta::hours(2)).await;
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(scorer.get_abuse_score_at("9", t0 + TimeDelta::hours(5)).await, 0.0);
    }

    #[tokio::test]
    async fn test_report_counts_and_orders_offenders() {
        let mut settings = AbuseSettings::default();
        settings.warn_threshold = 2.0;
        settings.block_threshold = 3.0;
        let scorer = scorer(settings);

        for _ in 0..3 {
            scorer.record_violation("alice", "pack_open").await;
        }
        for _ in 0..2 {
            scorer.record_violation("bob", "pack_open").await;
        }
        scorer.record_violation("carol", "pack_open").await;
        scorer.reset_abuse_score("carol").await;

        let report = scorer.report().await;
        assert_eq!(report.tracked_users, 3);
        assert_eq!(report.users_above_warn, 2);
        assert_eq!(report.users_above_block, 1);
        assert_eq!(report.total_violations, 6);
        let order: Vec<_> = report.top_offenders.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob"]);
        assert_eq!(report.top_offenders[0].level, AbuseLevel::Abusive);
    }

    #[tokio::test]
    async fn test_settings_swap() {
        let scorer = scorer(AbuseSettings::default());
        let mut settings = AbuseSettings::default();
        settings.violation_weight = 4.0;
        scorer.update_settings(settings);
        assert_eq!(scorer.record_violation("1", "battle").await, 4.0);
    }
}
