//! Admission API handlers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::server::AppState;
use crate::security::LoggerHealth;
use crate::store::StoreHealth;

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub user_id: String,
    pub action: String,
}

/// `POST /v1/admission`: one rate limit check for a command invocation.
pub async fn admission_handler(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> Response {
    let user_id = request.user_id.trim();
    let action = request.action.trim();
    if user_id.is_empty() || action.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "user_id and action are required" })),
        )
            .into_response();
    }

    match state.guard.admit(user_id, action).await {
        Ok(decision) => Json(decision).into_response(),
        Err(denial) => denial.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: StoreHealth,
    pub security_log: LoggerHealth,
}

/// `GET /health`: always 200 while serving; degraded modes are reported, not failed.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.store.health();
    let security_log = state.guard.events().health();
    let status = if store.degraded || !security_log.healthy {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        store,
        security_log,
    })
}
