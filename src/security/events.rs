//! Security event log.
//!
//! # Responsibilities
//! - Append immutable, structured events to every configured sink
//! - Notify the alert path for events at or above the alert severity
//! - Keep a bounded window of recent events for the admin API
//!
//! # Design Decisions
//! - Logging never fails the caller; sink and notifier failures are counted
//!   and surfaced through [`SecurityEventLogger::health`]
//! - Appends are serialised, so sinks see events in sequence order

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::SecurityLogConfig;
use crate::observability::metrics;

/// Upper bound for one alert notification.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default upper bound for one sink write.
pub const SINK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity `{other}`")),
        }
    }
}

/// One security-relevant occurrence. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub event_type: String,
    pub actor: String,
    pub details: Map<String, Value>,
}

impl SecurityEvent {
    fn new(sequence: u64, event_type: &str, severity: Severity, actor: &str, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            severity,
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            details,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("notification failed: {0}")]
    Notify(String),
}

/// Destination for security events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, event: &SecurityEvent) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn write(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut slot = self.file.lock().await;
        if slot.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *slot = Some(file);
        }

        let result = match slot.as_mut() {
            Some(file) => match file.write_all(&line).await {
                Ok(()) => file.flush().await,
                Err(error) => Err(error),
            },
            None => Ok(()),
        };
        if result.is_err() {
            // Reopen on the next event.
            *slot = None;
        }
        Ok(result?)
    }
}

/// Emits events as structured `tracing` records.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn write(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        let details = Value::Object(event.details.clone());
        match event.severity {
            Severity::Low => tracing::info!(
                target: "security",
                sequence = event.sequence,
                severity = %event.severity,
                event_type = %event.event_type,
                actor = %event.actor,
                details = %details,
                "Security event"
            ),
            Severity::Medium => tracing::warn!(
                target: "security",
                sequence = event.sequence,
                severity = %event.severity,
                event_type = %event.event_type,
                actor = %event.actor,
                details = %details,
                "Security event"
            ),
            Severity::High | Severity::Critical => tracing::error!(
                target: "security",
                sequence = event.sequence,
                severity = %event.severity,
                event_type = %event.event_type,
                actor = %event.actor,
                details = %details,
                "Security event"
            ),
        }
        Ok(())
    }
}

/// External notification path for high severity events.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &SecurityEvent) -> Result<(), SinkError>;
}

/// Default notifier: a dedicated log target that alerting can scrape.
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        tracing::error!(
            target: "security_alert",
            id = %event.id,
            severity = %event.severity,
            event_type = %event.event_type,
            actor = %event.actor,
            "Security alert"
        );
        Ok(())
    }
}

/// Logger health, reported separately from admission results.
#[derive(Debug, Clone, Serialize)]
pub struct LoggerHealth {
    pub healthy: bool,
    pub events_logged: u64,
    pub sink_failures: u64,
    pub notifier_failures: u64,
    pub last_failure: Option<String>,
}

pub struct SecurityEventLogger {
    sinks: Vec<Arc<dyn EventSink>>,
    notifier: Arc<dyn AlertNotifier>,
    alert_severity: ArcSwap<Severity>,
    /// Next sequence number; held for the whole append.
    append: tokio::sync::Mutex<u64>,
    recent: Mutex<VecDeque<SecurityEvent>>,
    recent_capacity: usize,
    sink_timeout: Duration,
    events_logged: AtomicU64,
    sink_failures: AtomicU64,
    notifier_failures: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl SecurityEventLogger {
    pub fn new(
        sinks: Vec<Arc<dyn EventSink>>,
        notifier: Arc<dyn AlertNotifier>,
        alert_severity: Severity,
        recent_capacity: usize,
    ) -> Self {
        Self {
            sinks,
            notifier,
            alert_severity: ArcSwap::from_pointee(alert_severity),
            append: tokio::sync::Mutex::new(1),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity.min(1024))),
            recent_capacity,
            sink_timeout: SINK_TIMEOUT,
            events_logged: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            notifier_failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    /// Tracing sink always, plus a JSON-lines file when `path` is set.
    pub fn from_config(config: &SecurityLogConfig) -> Self {
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        if let Some(path) = &config.path {
            sinks.push(Arc::new(JsonLinesSink::new(path)));
        }
        Self::new(
            sinks,
            Arc::new(LogNotifier),
            config.alert_severity,
            config.recent_capacity,
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Bound each sink write; a write that takes longer counts as a failure.
    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn alert_severity(&self) -> Severity {
        **self.alert_severity.load()
    }

    pub fn set_alert_severity(&self, severity: Severity) {
        self.alert_severity.store(Arc::new(severity));
    }

    /// Record a security event. Failures are counted, never returned.
    pub async fn log_suspicious_activity(
        &self,
        event_type: &str,
        severity: Severity,
        actor: &str,
        details: Value,
    ) -> SecurityEvent {
        let event = {
            let mut next = self.append.lock().await;
            let event = SecurityEvent::new(*next, event_type, severity, actor, details);
            *next += 1;

            for sink in &self.sinks {
                let failure = match tokio::time::timeout(self.sink_timeout, sink.write(&event)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => Some(error.to_string()),
                    Err(_) => Some(format!("timed out after {:?}", self.sink_timeout)),
                };
                if let Some(failure) = failure {
                    self.sink_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_sink_failure(sink.name());
                    tracing::warn!(sink = sink.name(), error = %failure, "Security event sink failed");
                    self.note_failure(format!("{}: {failure}", sink.name()));
                }
            }

            self.remember(event.clone());
            event
        };

        self.events_logged.fetch_add(1, Ordering::Relaxed);
        metrics::record_security_event(severity.as_str());

        if severity >= self.alert_severity() {
            self.alert(&event).await;
        }
        event
    }

    async fn alert(&self, event: &SecurityEvent) {
        let failure = match tokio::time::timeout(NOTIFY_TIMEOUT, self.notifier.notify(event)).await {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some(format!("timed out after {NOTIFY_TIMEOUT:?}")),
        };
        if let Some(failure) = failure {
            self.notifier_failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_sink_failure(self.notifier.name());
            tracing::warn!(notifier = self.notifier.name(), error = %failure, "Security alert failed");
            self.note_failure(format!("{}: {failure}", self.notifier.name()));
        }
    }

    fn remember(&self, event: SecurityEvent) {
        if self.recent_capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    fn note_failure(&self, failure: String) {
        *self.last_failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(failure);
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        let recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn health(&self) -> LoggerHealth {
        let sink_failures = self.sink_failures.load(Ordering::Relaxed);
        let notifier_failures = self.notifier_failures.load(Ordering::Relaxed);
        LoggerHealth {
            healthy: sink_failures == 0 && notifier_failures == 0,
            events_logged: self.events_logged.load(Ordering::Relaxed),
            sink_failures,
            notifier_failures,
            last_failure: self
                .last_failure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
