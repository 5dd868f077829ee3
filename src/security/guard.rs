//! Admission guard wrapped around command handlers.
//!
//! # Data Flow
//! ```text
//! Command invocation
//!     → block check (only when abuse.enforce_block is set)
//!     → RateLimiter::check_rate_limit
//!     → allowed: run handler unchanged
//!     → denied:  security event + user-facing message, handler skipped
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::config::GuardConfig;
use crate::observability::metrics;
use crate::security::abuse::AbuseScorer;
use crate::security::events::{SecurityEventLogger, Severity};
use crate::security::rate_limit::{ceil_secs, RateLimitDecision, RateLimiter};

/// Header carrying the bot user on HTTP-facing routes.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct GuardSettings {
    /// Log a `rate_limit_exceeded` event for every denial.
    pub log_denials: bool,
}

impl GuardSettings {
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            log_denials: config.security_log.log_denials,
        }
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self { log_denials: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    AbuseBlocked,
}

/// Why a command was refused, with what the user should be told.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub reason: DenialReason,
    pub user_id: String,
    pub action: String,
    pub retry_after: Option<Duration>,
    pub abuse_score: f64,
}

impl Denial {
    fn rate_limited(decision: &RateLimitDecision) -> Self {
        Self {
            reason: DenialReason::RateLimited,
            user_id: decision.user_id.clone(),
            action: decision.action.clone(),
            retry_after: decision.retry_after,
            abuse_score: decision.abuse_score.unwrap_or(0.0),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }

    /// Ephemeral reply shown to the user.
    pub fn message(&self) -> String {
        match (self.reason, self.retry_after) {
            (DenialReason::AbuseBlocked, _) => format!(
                "Too many requests. Your access to `{}` is temporarily restricted.",
                self.action
            ),
            (DenialReason::RateLimited, Some(wait)) if !wait.is_zero() => format!(
                "Slow down! You can use `{}` again in {}.",
                self.action,
                format_wait(wait)
            ),
            (DenialReason::RateLimited, _) => format!(
                "Too many requests! Please wait a moment before using `{}` again.",
                self.action
            ),
        }
    }
}

/// Human readable wait, rounded up to the second: `1h 5m`, `59m 12s`, `8s`.
pub fn format_wait(wait: Duration) -> String {
    let total = ceil_secs(wait).max(1);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    match (hours, minutes, seconds) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, 0, _) => format!("{h}h"),
        (h, m, _) => format!("{h}h {m}m"),
    }
}

#[derive(Serialize)]
struct DenialBody {
    allowed: bool,
    reason: DenialReason,
    message: String,
    retry_after_secs: Option<u64>,
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after_secs();
        let body = DenialBody {
            allowed: false,
            reason: self.reason,
            message: self.message(),
            retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result of a guarded handler invocation.
#[derive(Debug)]
pub enum GuardOutcome<T> {
    Completed(T),
    Denied(Denial),
}

impl<T> GuardOutcome<T> {
    pub fn is_denied(&self) -> bool {
        matches!(self, GuardOutcome::Denied(_))
    }

    pub fn into_result(self) -> Result<T, Denial> {
        match self {
            GuardOutcome::Completed(value) => Ok(value),
            GuardOutcome::Denied(denial) => Err(denial),
        }
    }
}

pub struct Guard {
    limiter: Arc<RateLimiter>,
    scorer: Arc<AbuseScorer>,
    events: Arc<SecurityEventLogger>,
    settings: ArcSwap<GuardSettings>,
}

impl Guard {
    pub fn new(
        limiter: Arc<RateLimiter>,
        scorer: Arc<AbuseScorer>,
        events: Arc<SecurityEventLogger>,
        settings: GuardSettings,
    ) -> Self {
        Self {
            limiter,
            scorer,
            events,
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn scorer(&self) -> &Arc<AbuseScorer> {
        &self.scorer
    }

    pub fn events(&self) -> &Arc<SecurityEventLogger> {
        &self.events
    }

    pub fn update_settings(&self, settings: GuardSettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Decide whether `user_id` may run `action` now.
    pub async fn admit(&self, user_id: &str, action: &str) -> Result<RateLimitDecision, Denial> {
        let abuse = self.scorer.settings();
        if abuse.enforce_block {
            let score = self.scorer.get_abuse_score(user_id).await;
            if score >= abuse.block_threshold {
                metrics::record_admission(self.limiter.action_label(action), "blocked");
                tracing::warn!(user_id, action, score, "Blocked user refused");
                self.events
                    .log_suspicious_activity(
                        "abuse_blocked",
                        Severity::High,
                        user_id,
                        json!({
                            "action": action,
                            "abuse_score": score,
                            "block_threshold": abuse.block_threshold,
                        }),
                    )
                    .await;
                return Err(Denial {
                    reason: DenialReason::AbuseBlocked,
                    user_id: user_id.to_string(),
                    action: action.to_string(),
                    retry_after: None,
                    abuse_score: score,
                });
            }
        }

        let decision = self.limiter.check_rate_limit(user_id, action).await;
        if decision.allowed {
            return Ok(decision);
        }

        let denial = Denial::rate_limited(&decision);
        let log_denials = self.settings.load().log_denials;
        if log_denials {
            let severity = self.severity_for(denial.abuse_score);
            self.events
                .log_suspicious_activity(
                    "rate_limit_exceeded",
                    severity,
                    user_id,
                    json!({
                        "action": action,
                        "strategy": decision.strategy,
                        "count": decision.count,
                        "limit": decision.limit,
                        "window_secs": decision.window_secs,
                        "retry_after_secs": decision.retry_after_secs(),
                        "abuse_score": denial.abuse_score,
                        "degraded": decision.degraded,
                    }),
                )
                .await;
        }
        Err(denial)
    }

    /// Severity of a denial event, rising with the user's abuse score.
    pub fn severity_for(&self, score: f64) -> Severity {
        let abuse = self.scorer.settings();
        if score >= abuse.block_threshold {
            Severity::High
        } else if score >= abuse.warn_threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Run `handler` only if the command is admitted.
    pub async fn run<F, Fut, T>(&self, user_id: &str, action: &str, handler: F) -> GuardOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.admit(user_id, action).await {
            Ok(_) => GuardOutcome::Completed(handler().await),
            Err(denial) => GuardOutcome::Denied(denial),
        }
    }
}

/// State for [`command_guard`]: the guard plus the action a route counts as.
#[derive(Clone)]
pub struct CommandGuard {
    guard: Arc<Guard>,
    action: Arc<str>,
}

impl CommandGuard {
    pub fn new(guard: Arc<Guard>, action: &str) -> Self {
        Self {
            guard,
            action: Arc::from(action),
        }
    }
}

/// Middleware guarding an HTTP route as one action.
///
/// The user comes from `X-User-Id`, falling back to the client IP.
pub async fn command_guard(
    State(command): State<CommandGuard>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());

    match command.guard.admit(&user_id, &command.action).await {
        Ok(_) => next.run(request).await,
        Err(denial) => denial.into_response(),
    }
}
