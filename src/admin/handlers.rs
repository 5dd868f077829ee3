use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::server::AppState;
use crate::security::{AbuseReport, SecurityEvent, Severity, UserAbuseSummary};
use crate::store::StoreHealth;

/// Default and maximum page size for `/admin/events`.
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub rate_limiting_enabled: bool,
    pub actions: Vec<String>,
    pub store: StoreHealth,
    pub events_logged: u64,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let settings = state.guard.limiter().settings();
    let mut actions: Vec<String> = settings.limits.keys().cloned().collect();
    actions.sort();
    let store = state.store.health();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if store.degraded { "degraded" } else { "operational" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        rate_limiting_enabled: settings.enabled,
        actions,
        store,
        events_logged: state.guard.events().health().events_logged,
    })
}

pub async fn get_abuse_report(State(state): State<AppState>) -> Json<AbuseReport> {
    Json(state.guard.scorer().report().await)
}

pub async fn get_user_abuse(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserAbuseSummary>, StatusCode> {
    state
        .guard
        .scorer()
        .summary(&user_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub user_id: String,
    pub reset: bool,
    pub previous_score: f64,
}

pub async fn reset_user_abuse(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<ResetResponse> {
    let scorer = state.guard.scorer();
    let previous_score = scorer.get_abuse_score(&user_id).await;
    let reset = scorer.reset_abuse_score(&user_id).await;

    state
        .guard
        .events()
        .log_suspicious_activity(
            "abuse_score_reset",
            Severity::Low,
            "admin",
            json!({ "user_id": user_id, "previous_score": previous_score, "had_record": reset }),
        )
        .await;

    Json(ResetResponse {
        user_id,
        reset,
        previous_score,
    })
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<SecurityEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    Json(state.guard.events().recent(limit))
}
