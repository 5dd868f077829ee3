//! Redis-backed store shared by every bot instance.

use std::collections::VecDeque;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::OnceCell;

use crate::config::Strategy;
use crate::store::{
    AbuseScoreRecord, Admission, GuardStore, ResolvedRule, ScorePolicy, StoreError, StoreResult,
};

const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local count = tonumber(redis.call('GET', key) or '0')
if count >= limit then
  local ttl = redis.call('PTTL', key)
  if ttl < 0 then
    redis.call('PEXPIRE', key, window)
    ttl = window
  end
  return {0, count, 0, ttl}
end

count = redis.call('INCR', key)
if redis.call('PTTL', key) < 0 then
  redis.call('PEXPIRE', key, window)
end
return {1, count, limit - count, 0}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= limit then
  local retry = window
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
  end
  return {0, count, 0, retry}
end

redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)
return {1, count + 1, limit - count - 1, 0}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local rate = capacity / window

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

tokens = math.min(capacity, tokens + math.max(0, now - ts) * rate)
local allowed = 0
local retry = 0
if tokens + 1e-9 >= 1 then
  tokens = math.max(0, tokens - 1)
  allowed = 1
else
  retry = math.ceil((1 - tokens) / rate)
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', key, window)
local remaining = math.floor(tokens)
return {allowed, capacity - remaining, remaining, retry}
"#;

const RECORD_VIOLATION_SCRIPT: &str = r#"
local record = KEYS[1]
local history = KEYS[2]
local users = KEYS[3]
local weight = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local decay = tonumber(ARGV[3])
local cap = tonumber(ARGV[4])
local user = ARGV[5]

local score = tonumber(redis.call('HGET', record, 'score') or '0')
local updated = tonumber(redis.call('HGET', record, 'updated_ms') or ARGV[2])
if decay > 0 then
  score = math.max(0, score - decay * math.max(0, now - updated) / 3600000)
end
score = score + weight

local total = redis.call('HINCRBY', record, 'total', 1)
redis.call('HSET', record, 'score', tostring(score), 'updated_ms', now)
redis.call('LPUSH', history, now)
redis.call('LTRIM', history, 0, cap - 1)
redis.call('SADD', users, user)
return {tostring(score), total, now, redis.call('LRANGE', history, 0, -1)}
"#;

const RESET_ABUSE_SCRIPT: &str = r#"
local record = KEYS[1]
local history = KEYS[2]
local now = ARGV[1]

if redis.call('EXISTS', record) == 0 then
  return 0
end
redis.call('HSET', record, 'score', '0', 'updated_ms', now)
redis.call('DEL', history)
return 1
"#;

static FIXED_WINDOW: LazyLock<Script> = LazyLock::new(|| Script::new(FIXED_WINDOW_SCRIPT));
static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| Script::new(SLIDING_WINDOW_SCRIPT));
static TOKEN_BUCKET: LazyLock<Script> = LazyLock::new(|| Script::new(TOKEN_BUCKET_SCRIPT));
static RECORD_VIOLATION: LazyLock<Script> = LazyLock::new(|| Script::new(RECORD_VIOLATION_SCRIPT));
static RESET_ABUSE: LazyLock<Script> = LazyLock::new(|| Script::new(RESET_ABUSE_SCRIPT));

/// Redis implementation of [`GuardStore`].
///
/// The connection is opened lazily so a guard can start while Redis is down;
/// the connection manager reconnects on its own afterwards.
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
    connection: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Creates a store from a Redis URL and key prefix.
    pub fn open(redis_url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|error| StoreError::Unavailable(format!("invalid redis url: {error}")))?;
        Ok(Self::new(client, key_prefix))
    }

    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            connection: OnceCell::new(),
        }
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}:{key}", self.key_prefix)
    }

    /// Each strategy keeps a different Redis type, so the strategy is part of the key.
    fn rate_key(&self, key: &str, strategy: Strategy) -> String {
        format!("{}:{key}:{strategy}", self.key_prefix)
    }

    fn abuse_keys(&self, user_id: &str) -> (String, String) {
        let record = self.key_for(&format!("abuse:{user_id}"));
        let history = format!("{record}:history");
        (record, history)
    }

    fn users_key(&self) -> String {
        self.key_for("abuse:users")
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                tracing::debug!("Connecting to redis");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }

    async fn read_record(
        &self,
        conn: &mut ConnectionManager,
        user_id: &str,
    ) -> StoreResult<Option<AbuseScoreRecord>> {
        let (record_key, history_key) = self.abuse_keys(user_id);
        let ((score, total, updated_ms), history): (
            (Option<String>, Option<i64>, Option<i64>),
            Vec<i64>,
        ) = redis::pipe()
            .cmd("HMGET")
            .arg(&record_key)
            .arg("score")
            .arg("total")
            .arg("updated_ms")
            .cmd("LRANGE")
            .arg(&history_key)
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await?;

        let Some(score) = score else {
            return Ok(None);
        };
        build_record(&score, total.unwrap_or(0), updated_ms.unwrap_or(0), history).map(Some)
    }
}

fn timestamp(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp: {ms}")))
}

fn build_record(
    score: &str,
    total: i64,
    updated_ms: i64,
    history: Vec<i64>,
) -> StoreResult<AbuseScoreRecord> {
    let score: f64 = score
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid abuse score: {score}")))?;
    let history = history
        .into_iter()
        .map(timestamp)
        .collect::<StoreResult<VecDeque<_>>>()?;

    Ok(AbuseScoreRecord {
        score,
        total_violations: u64::try_from(total).unwrap_or(0),
        history,
        updated_at: timestamp(updated_ms)?,
    })
}

fn to_admission(allowed: i64, count: i64, remaining: i64, retry_ms: i64) -> Admission {
    let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
    if allowed == 1 {
        Admission::allowed(count, u32::try_from(remaining.max(0)).unwrap_or(u32::MAX))
    } else {
        Admission::denied(count, retry_ms)
    }
}

#[async_trait]
impl GuardStore for RedisStore {
    async fn acquire(
        &self,
        key: &str,
        rule: &ResolvedRule,
        now: DateTime<Utc>,
    ) -> StoreResult<Admission> {
        let mut conn = self.connection().await?;
        let redis_key = self.rate_key(key, rule.strategy);
        let now_ms = now.timestamp_millis();

        let script: &Script = match rule.strategy {
            Strategy::FixedWindow => &FIXED_WINDOW,
            Strategy::SlidingWindow => &SLIDING_WINDOW,
            Strategy::TokenBucket => &TOKEN_BUCKET,
        };
        let mut invocation = script.key(redis_key);
        invocation.arg(rule.limit).arg(rule.window_ms()).arg(now_ms);
        if rule.strategy == Strategy::SlidingWindow {
            invocation.arg(uuid::Uuid::new_v4().to_string());
        }

        let (allowed, count, remaining, retry_ms): (i64, i64, i64, i64) =
            invocation.invoke_async(&mut conn).await?;

        Ok(to_admission(allowed, count, remaining, retry_ms))
    }

    async fn record_violation(
        &self,
        user_id: &str,
        weight: f64,
        policy: &ScorePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<AbuseScoreRecord> {
        let mut conn = self.connection().await?;
        let (record_key, history_key) = self.abuse_keys(user_id);

        let (score, total, updated_ms, history): (String, i64, i64, Vec<i64>) =
            RECORD_VIOLATION
                .key(record_key)
                .key(history_key)
                .key(self.users_key())
                .arg(weight)
                .arg(now.timestamp_millis())
                .arg(policy.decay_per_hour)
                .arg(policy.history_limit.max(1))
                .arg(user_id)
                .invoke_async(&mut conn)
                .await?;

        build_record(&score, total, updated_ms, history)
    }

    async fn abuse_record(&self, user_id: &str) -> StoreResult<Option<AbuseScoreRecord>> {
        let mut conn = self.connection().await?;
        self.read_record(&mut conn, user_id).await
    }

    async fn reset_abuse(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let (record_key, history_key) = self.abuse_keys(user_id);

        let existed: i64 = RESET_ABUSE
            .key(record_key)
            .key(history_key)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(existed == 1)
    }

    async fn abuse_records(&self) -> StoreResult<Vec<(String, AbuseScoreRecord)>> {
        let mut conn = self.connection().await?;
        let users: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.users_key())
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(users.len());
        for user in users {
            if let Some(record) = self.read_record(&mut conn, &user).await? {
                records.push((user, record));
            }
        }
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefixed() {
        let store = RedisStore::open("redis://127.0.0.1:6379", "legends").unwrap();
        assert_eq!(store.key_for("rl:pack_create:42"), "legends:rl:pack_create:42");
        assert_eq!(
            store.rate_key("rl:trade:5", Strategy::TokenBucket),
            "legends:rl:trade:5:token_bucket"
        );
        assert_ne!(
            store.rate_key("rl:trade:5", Strategy::FixedWindow),
            store.rate_key("rl:trade:5", Strategy::SlidingWindow)
        );
        assert_eq!(
            store.abuse_keys("42"),
            ("legends:abuse:42".to_string(), "legends:abuse:42:history".to_string())
        );
        assert_eq!(store.users_key(), "legends:abuse:users");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            RedisStore::open("not a url", "legends"),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_build_record_parses_lua_output() {
        let record = build_record("2.5", 3, 1_700_000_000_000, vec![1_700_000_000_000]).unwrap();
        assert_eq!(record.score, 2.5);
        assert_eq!(record.total_violations, 3);
        assert_eq!(record.history.len(), 1);
        assert!(matches!(
            build_record("nan?", 1, 0, vec![]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_to_admission() {
        assert_eq!(to_admission(1, 3, 2, 0), Admission::allowed(3, 2));
        let denied = to_admission(0, 5, 0, 1500);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(std::time::Duration::from_millis(1500)));
    }
}
