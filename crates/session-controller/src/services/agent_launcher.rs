//! Agent orchestrator client.
//!
//! Asks the orchestrator to put the creator's agent participant into a room.
//! Called only from the job dispatcher, which owns retries.

use crate::errors::ScError;
use crate::models::AgentStartPayload;
use crate::observability::metrics;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

/// Default timeout for orchestrator requests in seconds.
const AGENT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Starts agent participants.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Ask for the agent described by `payload` to join its room.
    async fn launch(&self, payload: &AgentStartPayload) -> Result<(), ScError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest<'a> {
    session_id: String,
    room_id: &'a str,
    creator_id: String,
    credential: &'a str,
}

/// HTTP client for the agent orchestrator.
#[derive(Clone)]
pub struct HttpAgentLauncher {
    client: Client,
    base_url: String,
}

impl HttpAgentLauncher {
    /// Create a new orchestrator client.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, ScError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(AGENT_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sc.services.agent", error = %e, "Failed to build HTTP client");
                ScError::Internal
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn launch_inner(&self, payload: &AgentStartPayload) -> Result<(), ScError> {
        let url = format!("{}/v1/agents/launch", self.base_url);
        let request = LaunchRequest {
            session_id: payload.session_id.to_string(),
            room_id: &payload.room_id,
            creator_id: payload.creator_id.to_string(),
            credential: &payload.agent_credential,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "sc.services.agent", error = %e, "Agent launch request failed");
                ScError::UpstreamUnavailable("Agent orchestrator is unavailable".to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        warn!(target: "sc.services.agent", status = %status, "Agent orchestrator returned error");
        Err(ScError::UpstreamUnavailable(format!(
            "Agent orchestrator returned {status}"
        )))
    }
}

#[async_trait]
impl AgentLauncher for HttpAgentLauncher {
    #[instrument(skip_all, fields(session_id = %payload.session_id, room_id = %payload.room_id))]
    async fn launch(&self, payload: &AgentStartPayload) -> Result<(), ScError> {
        let start = Instant::now();
        let result = self.launch_inner(payload).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_gateway_call("agent", "launch", status, start.elapsed());
        result
    }
}

/// Mock agent launcher module for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Mock agent launcher for unit testing.
    pub struct MockAgentLauncher {
        /// Calls that fail before the first success (`usize::MAX` = always).
        failures_before_success: usize,
        /// Number of calls made.
        call_count: AtomicUsize,
        launched: Mutex<Vec<AgentStartPayload>>,
    }

    impl MockAgentLauncher {
        /// Create a mock that always succeeds.
        pub fn accepting() -> Self {
            Self::failing_times(0)
        }

        /// Create a mock that fails `n` times, then succeeds.
        pub fn failing_times(n: usize) -> Self {
            Self {
                failures_before_success: n,
                call_count: AtomicUsize::new(0),
                launched: Mutex::new(Vec::new()),
            }
        }

        /// Create a mock that always fails.
        pub fn failing() -> Self {
            Self::failing_times(usize::MAX)
        }

        /// Get the number of calls made.
        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Payloads of successful launches.
        pub async fn launched(&self) -> Vec<AgentStartPayload> {
            self.launched.lock().await.clone()
        }
    }

    #[async_trait]
    impl AgentLauncher for MockAgentLauncher {
        async fn launch(&self, payload: &AgentStartPayload) -> Result<(), ScError> {
            let count = self.call_count.fetch_add(1, Ordering::SeqCst);

            if count < self.failures_before_success {
                return Err(ScError::UpstreamUnavailable(
                    "Mock agent orchestrator error".to_string(),
                ));
            }

            self.launched.lock().await.push(payload.clone());
            Ok(())
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;
        use common::types::{CreatorId, SessionId};

        fn payload() -> AgentStartPayload {
            AgentStartPayload {
                session_id: SessionId::new(),
                room_id: "session-1".to_string(),
                creator_id: CreatorId::new(),
                agent_credential: "token".to_string(),
            }
        }

        #[tokio::test]
        async fn test_mock_fails_then_succeeds() {
            let mock = MockAgentLauncher::failing_times(2);

            assert!(mock.launch(&payload()).await.is_err());
            assert!(mock.launch(&payload()).await.is_err());
            assert!(mock.launch(&payload()).await.is_ok());

            assert_eq!(mock.call_count(), 3);
            assert_eq!(mock.launched().await.len(), 1);
        }

        #[tokio::test]
        async fn test_mock_failing_never_succeeds() {
            let mock = MockAgentLauncher::failing();
            for _ in 0..5 {
                assert!(mock.launch(&payload()).await.is_err());
            }
            assert!(mock.launched().await.is_empty());
        }
    }
}
