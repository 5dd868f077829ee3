//! Shared-store tests against a live Redis.
//!
//! Skipped unless `REDIS_URL` is set, e.g. `REDIS_URL=redis://127.0.0.1:6379`.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use legends_guard::config::Strategy;
use legends_guard::store::{GuardStore, RedisStore, ResolvedRule, ScorePolicy};
use uuid::Uuid;

fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|url| !url.is_empty())
}

/// Two stores sharing a fresh prefix, as two bot instances would.
fn instances(url: &str) -> (Arc<RedisStore>, Arc<RedisStore>) {
    let prefix = format!("guard-test-{}", Uuid::new_v4());
    (
        Arc::new(RedisStore::open(url, prefix.clone()).unwrap()),
        Arc::new(RedisStore::open(url, prefix).unwrap()),
    )
}

fn rule(strategy: Strategy, limit: u32, window_secs: u64) -> ResolvedRule {
    ResolvedRule {
        strategy,
        limit,
        window_secs,
    }
}

#[tokio::test]
async fn test_instances_share_one_quota() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let (a, b) = instances(&url);
    let now = Utc::now();

    for strategy in [Strategy::FixedWindow, Strategy::SlidingWindow, Strategy::TokenBucket] {
        let rule = rule(strategy, 7, 60);
        let key = format!("rl:{strategy}:42");

        let mut tasks = Vec::new();
        for i in 0..40 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            let key = key.clone();
            tasks.push(tokio::spawn(async move { store.acquire(&key, &rule, now).await.unwrap() }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7, "{strategy} admitted the wrong number");
    }
}

#[tokio::test]
async fn test_fixed_window_resets_and_denials_do_not_count() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let (store, _) = instances(&url);
    let rule = rule(Strategy::FixedWindow, 2, 1);
    let t0 = Utc::now();

    assert!(store.acquire("rl:trade:1", &rule, t0).await.unwrap().allowed);
    assert!(store.acquire("rl:trade:1", &rule, t0).await.unwrap().allowed);
    let denied = store.acquire("rl:trade:1", &rule, t0).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.count, 2);
    assert!(denied.retry_after.is_some());

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let later = t0 + TimeDelta::milliseconds(1100);
    assert!(store.acquire("rl:trade:1", &rule, later).await.unwrap().allowed);
}

#[tokio::test]
async fn test_abuse_records_round_trip() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let (a, b) = instances(&url);
    let policy = ScorePolicy::default();
    let now = Utc::now();

    a.record_violation("42", 1.0, &policy, now).await.unwrap();
    let record = b.record_violation("42", 2.5, &policy, now).await.unwrap();
    assert_eq!(record.score, 3.5);
    assert_eq!(record.total_violations, 2);
    assert_eq!(record.history.len(), 2);

    let records = a.abuse_records().await.unwrap();
    assert_eq!(records.len(), 1);

    assert!(b.reset_abuse("42", now).await.unwrap());
    let record = a.abuse_record("42").await.unwrap().unwrap();
    assert_eq!(record.score, 0.0);
    assert_eq!(record.total_violations, 2);
    assert!(record.history.is_empty());
}

#[tokio::test]
async fn test_strategy_change_keeps_store_usable() {
    let Some(url) = redis_url() else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let (store, _) = instances(&url);
    let now = Utc::now();

    let bucket = rule(Strategy::TokenBucket, 3, 60);
    assert!(store.acquire("rl:trade:5", &bucket, now).await.unwrap().allowed);

    // Same action reloaded with a different strategy.
    let fixed = rule(Strategy::FixedWindow, 1, 60);
    let first = store.acquire("rl:trade:5", &fixed, now).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.count, 1);
    assert!(!store.acquire("rl:trade:5", &fixed, now).await.unwrap().allowed);

    let sliding = rule(Strategy::SlidingWindow, 2, 60);
    assert!(store.acquire("rl:trade:5", &sliding, now).await.unwrap().allowed);
}
