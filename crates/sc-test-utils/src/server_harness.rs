//! Test server harness for E2E testing
//!
//! Provides `TestScServer` for spawning real SC server instances in tests.

use crate::harness::TestHarness;
use metrics_exporter_prometheus::PrometheusBuilder;
use session_controller::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the Session Controller HTTP server.
///
/// The server shares the harness's session manager and memory store, so tests
/// can drive it over HTTP and inspect state through the harness.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_e2e() -> anyhow::Result<()> {
///     let harness = TestHarness::builder().build();
///     let server = TestScServer::spawn(&harness).await?;
///
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestScServer {
    addr: SocketAddr,
    _handle: JoinHandle<()>,
}

impl TestScServer {
    /// Spawn a server bound to a random port on 127.0.0.1.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn spawn(harness: &TestHarness) -> Result<Self, anyhow::Error> {
        let state = Arc::new(AppState {
            manager: harness.manager.clone(),
            store_health: harness.store.clone(),
        });

        // Recorder is not installed globally; the scrape endpoint renders empty.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let app = routes::build_routes(state, metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TestScServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}
