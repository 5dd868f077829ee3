//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the store, scorer, limiter, event logger and guard from config
//! - Create the Axum router with admission, health and admin routes
//! - Apply hot-reloaded configuration without dropping counters
//! - Purge idle local state in the background
//! - Serve until the shutdown signal fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin::setup_admin_router;
use crate::config::GuardConfig;
use crate::http::admission::{admission_handler, health_handler};
use crate::security::{
    AbuseScorer, AbuseSettings, Guard, GuardSettings, RateLimitSettings, RateLimiter,
    SecurityEventLogger,
};
use crate::store::{GuardStore, ResilientStore, StoreResult};

/// Interval between sweeps of idle process-local state.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<Guard>,
    pub store: Arc<ResilientStore>,
    pub config: Arc<ArcSwap<GuardConfig>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component from `config`.
    pub fn from_config(config: GuardConfig) -> StoreResult<Self> {
        let store = Arc::new(ResilientStore::from_config(&config.store)?);
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: GuardConfig, store: Arc<ResilientStore>) -> Self {
        let shared: Arc<dyn GuardStore> = store.clone();
        let scorer = Arc::new(AbuseScorer::new(
            shared.clone(),
            AbuseSettings::from(&config.abuse),
        ));
        let limiter = Arc::new(RateLimiter::new(
            shared,
            scorer.clone(),
            RateLimitSettings::from_config(&config),
        ));
        let events = Arc::new(SecurityEventLogger::from_config(&config.security_log));
        let guard = Arc::new(Guard::new(
            limiter,
            scorer,
            events,
            GuardSettings::from_config(&config),
        ));

        Self {
            guard,
            store,
            config: Arc::new(ArcSwap::from_pointee(config)),
            started_at: Instant::now(),
        }
    }

    /// Swap in a reloaded configuration. Counters and scores are kept.
    pub fn apply_config(&self, config: GuardConfig) {
        let current = self.config.load_full();
        if current.store.redis_url != config.store.redis_url
            || current.store.key_prefix != config.store.key_prefix
        {
            tracing::warn!("Store settings changed; restart the guard to apply them");
        }
        if current.server.bind_address != config.server.bind_address {
            tracing::warn!("Bind address changed; restart the guard to apply it");
        }

        self.guard
            .limiter()
            .update_settings(RateLimitSettings::from_config(&config));
        self.guard
            .scorer()
            .update_settings(AbuseSettings::from(&config.abuse));
        self.guard
            .events()
            .set_alert_severity(config.security_log.alert_severity);
        self.guard.update_settings(GuardSettings::from_config(&config));
        self.config.store(Arc::new(config));

        tracing::info!("Configuration reloaded");
    }
}

/// HTTP server for the admission guard.
pub struct GuardServer {
    router: Router,
    state: AppState,
}

impl GuardServer {
    /// Create a new server with the given configuration.
    pub fn new(config: GuardConfig) -> StoreResult<Self> {
        Ok(Self::from_state(AppState::from_config(config)?))
    }

    pub fn from_state(state: AppState) -> Self {
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState) -> Router {
        let config = state.config.load_full();

        let mut router = Router::new()
            .route("/v1/admission", post(admission_handler))
            .route("/health", get(health_handler))
            .with_state(state.clone());

        if config.admin.enabled {
            router = router.merge(setup_admin_router(state));
        }

        router
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.server.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Reloaded configs arriving on `config_updates` are applied in place.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GuardConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Admission server starting");

        let state = self.state.clone();
        let reload_task = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                state.apply_config(config);
            }
        });

        let local = self.state.store.local().clone();
        let purge_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = local.purge_idle(Utc::now());
                if purged > 0 {
                    tracing::debug!(purged, "Purged idle rate limit state");
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;

        reload_task.abort();
        purge_task.abort();

        tracing::info!("Admission server stopped");
        result
    }
}
