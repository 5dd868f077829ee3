//! Admin API: abuse inspection, score resets and recent security events.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/abuse/report", get(get_abuse_report))
        .route("/admin/abuse/{user_id}", get(get_user_abuse))
        .route("/admin/abuse/{user_id}/reset", post(reset_user_abuse))
        .route("/admin/events", get(get_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}
