//! Music Legends admission guard.
//!
//! # Architecture Overview
//!
//! ```text
//!     Bot command / webhook
//!     ─────────────────────▶ POST /v1/admission
//!                                  │
//!                                  ▼
//!                          ┌───────────────┐     ┌────────────────┐
//!                          │     Guard     │────▶│ SecurityEvent  │──▶ tracing / JSONL / alert
//!                          └──────┬────────┘     │    Logger      │
//!                                 │              └────────────────┘
//!                                 ▼
//!                          ┌───────────────┐     ┌────────────────┐
//!                          │  RateLimiter  │────▶│  AbuseScorer   │
//!                          └──────┬────────┘     └───────┬────────┘
//!                                 │                      │
//!                                 ▼                      ▼
//!                          ┌─────────────────────────────────────┐
//!                          │ ResilientStore: Redis ▸ local memory │
//!                          └─────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use legends_guard::config::{load_config, ConfigWatcher, GuardConfig};
use legends_guard::lifecycle::{shutdown_signal, Shutdown};
use legends_guard::observability::{logging, metrics};
use legends_guard::GuardServer;

#[derive(Parser)]
#[command(name = "legends-guard")]
#[command(about = "Rate limiting and abuse scoring for Music Legends commands", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GuardConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "legends-guard starting");
    tracing::info!(
        bind_address = %config.server.bind_address,
        shared_store = config.store.redis_url.is_some(),
        actions = config.limits.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher must stay alive for reloads to be delivered.
    let (config_updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let handle = match watcher.run() {
                Ok(handle) => Some(handle),
                Err(error) => {
                    tracing::warn!(error = %error, "Config hot reload disabled");
                    None
                }
            };
            (updates, handle)
        }
        None => (tokio::sync::mpsc::unbounded_channel().1, None),
    };

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = GuardServer::new(config)?;
    let stopped = shutdown.subscribe();

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });

    server.run(listener, config_updates, stopped).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
