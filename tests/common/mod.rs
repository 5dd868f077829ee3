//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use legends_guard::config::GuardConfig;
use legends_guard::lifecycle::Shutdown;
use legends_guard::GuardServer;
use tokio::sync::mpsc;

pub const ADMIN_KEY: &str = "test-admin-key";

/// A guard served on an ephemeral port.
#[allow(dead_code)]
pub struct TestGuard {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub config_updates: mpsc::UnboundedSender<GuardConfig>,
    pub client: reqwest::Client,
}

#[allow(dead_code)]
impl TestGuard {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn admit(&self, user_id: &str, action: &str) -> reqwest::Response {
        self.client
            .post(self.url("/v1/admission"))
            .json(&serde_json::json!({ "user_id": user_id, "action": action }))
            .send()
            .await
            .expect("guard unreachable")
    }

    pub fn admin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(ADMIN_KEY)
    }

    pub fn admin_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(ADMIN_KEY)
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Config with the test admin key and everything else at defaults.
pub fn test_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.admin.api_key = ADMIN_KEY.to_string();
    config
}

pub async fn start_guard(config: GuardConfig) -> TestGuard {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (config_updates, updates_rx) = mpsc::unbounded_channel();
    let server = GuardServer::new(config).expect("server should build");
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, updates_rx, server_shutdown).await;
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap();

    TestGuard {
        addr,
        shutdown,
        config_updates,
        client,
    }
}
