//! The `command_guard` middleware in front of an ordinary axum route.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::post,
    Router,
};
use legends_guard::config::ActionLimit;
use legends_guard::security::{
    command_guard, AbuseScorer, AbuseSettings, CommandGuard, Guard, GuardSettings, LogNotifier,
    RateLimitSettings, RateLimiter, SecurityEventLogger, Severity,
};
use legends_guard::store::{GuardStore, MemoryStore};
use tower::ServiceExt;

fn app() -> Router {
    let store: Arc<dyn GuardStore> = Arc::new(MemoryStore::new());
    let scorer = Arc::new(AbuseScorer::new(store.clone(), AbuseSettings::default()));
    let mut settings = RateLimitSettings::default();
    settings.limits.insert("trade".into(), ActionLimit::new(2, 300));
    let limiter = Arc::new(RateLimiter::new(store, scorer.clone(), settings));
    let events = Arc::new(SecurityEventLogger::new(vec![], Arc::new(LogNotifier), Severity::Critical, 10));
    let guard = Arc::new(Guard::new(limiter, scorer, events, GuardSettings::default()));

    Router::new()
        .route("/trade", post(|| async { "traded" }))
        .layer(middleware::from_fn_with_state(
            CommandGuard::new(guard, "trade"),
            command_guard,
        ))
}

fn trade(user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/trade");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_route_is_guarded_per_user() {
    let app = app();

    for _ in 0..2 {
        let res = app.clone().oneshot(trade(Some("42"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    let res = app.clone().oneshot(trade(Some("42"))).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().contains_key("retry-after"));

    let res = app.clone().oneshot(trade(Some("43"))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_requests_without_identity_share_a_bucket() {
    let app = app();

    for _ in 0..2 {
        assert_eq!(app.clone().oneshot(trade(None)).await.unwrap().status(), StatusCode::OK);
    }
    let res = app.clone().oneshot(trade(Some(" "))).await.unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}
