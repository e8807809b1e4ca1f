//! In-memory wiring of the session manager.
//!
//! `TestHarness` builds the same object graph `main` does, with the memory
//! store and the gateway mocks in place of Postgres and the network clients.

use crate::fixtures::Seed;
use common::types::SessionId;
use session_controller::dispatcher::{process_next, JobDispatcher};
use session_controller::lifecycle::{Collaborators, LifecycleSettings, SessionManager};
use session_controller::models::{ForwardStatus, UsageRecord};
use session_controller::reconciler::{ReconcilerHandle, ReconciliationListener, UsageEmitter};
use session_controller::services::agent_launcher::mock::MockAgentLauncher;
use session_controller::services::billing_gateway::mock::MockBillingGateway;
use session_controller::services::room_gateway::mock::MockRoomGateway;
use session_controller::store::memory::MemoryStore;
use session_controller::store::UsageLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long `wait_for_usage` polls before failing the test.
const USAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ledger append retry policy of the harness reconciler.
const TEST_APPEND_ATTEMPTS: u32 = 4;
const TEST_APPEND_BACKOFF: Duration = Duration::from_millis(5);

/// Lease used when the harness drives jobs by hand.
const TEST_JOB_LEASE: Duration = Duration::from_secs(30);

/// Builder for [`TestHarness`].
pub struct TestHarnessBuilder {
    rooms: MockRoomGateway,
    billing: MockBillingGateway,
    launcher: MockAgentLauncher,
    settings: LifecycleSettings,
    shards: usize,
}

impl TestHarnessBuilder {
    pub fn rooms(mut self, rooms: MockRoomGateway) -> Self {
        self.rooms = rooms;
        self
    }

    pub fn billing(mut self, billing: MockBillingGateway) -> Self {
        self.billing = billing;
        self
    }

    pub fn launcher(mut self, launcher: MockAgentLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Attempts allowed for agent-start jobs.
    pub fn job_max_attempts(mut self, max_attempts: u32) -> Self {
        self.settings.job_max_attempts = max_attempts;
        self
    }

    pub fn reconciler_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Wire everything and start the reconciliation listener.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> TestHarness {
        let store = Arc::new(MemoryStore::new());
        let rooms = Arc::new(self.rooms);
        let billing = Arc::new(self.billing);
        let launcher = Arc::new(self.launcher);
        let cancel_token = CancellationToken::new();

        let (usage, reconciler) = ReconciliationListener::new(store.clone(), billing.clone())
            .with_append_retry(TEST_APPEND_ATTEMPTS, TEST_APPEND_BACKOFF)
            .spawn(self.shards, cancel_token.child_token());

        let dispatcher = JobDispatcher::new(store.clone());
        let manager = Arc::new(SessionManager::new(
            Collaborators {
                sessions: store.clone(),
                accounts: store.clone(),
                rooms: rooms.clone(),
                billing: billing.clone(),
                dispatcher: dispatcher.clone(),
                usage: usage.clone(),
            },
            self.settings.clone(),
        ));

        TestHarness {
            store,
            rooms,
            billing,
            launcher,
            manager,
            dispatcher,
            usage,
            settings: self.settings,
            cancel_token,
            reconciler: Some(reconciler),
        }
    }
}

/// A session manager backed by the memory store and gateway mocks.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub rooms: Arc<MockRoomGateway>,
    pub billing: Arc<MockBillingGateway>,
    pub launcher: Arc<MockAgentLauncher>,
    pub manager: Arc<SessionManager>,
    pub dispatcher: JobDispatcher,
    pub usage: UsageEmitter,
    pub settings: LifecycleSettings,
    cancel_token: CancellationToken,
    reconciler: Option<ReconcilerHandle>,
}

impl TestHarness {
    /// Builder with accepting mocks, two reconciler shards and the default
    /// meter names.
    pub fn builder() -> TestHarnessBuilder {
        let config = crate::fixtures::test_config();
        TestHarnessBuilder {
            rooms: MockRoomGateway::new(),
            billing: MockBillingGateway::new(),
            launcher: MockAgentLauncher::accepting(),
            settings: LifecycleSettings::from_config(&config),
            shards: 2,
        }
    }

    /// Store a fresh tenant, creator and fan.
    pub async fn seed(&self) -> Seed {
        let seed = Seed::new();
        seed.insert_into(&self.store).await;
        seed
    }

    /// Ledger entries of a session in append order.
    ///
    /// # Panics
    ///
    /// Panics if the memory store fails.
    pub async fn ledger(&self, session_id: SessionId) -> Vec<UsageRecord> {
        self.store
            .list_for_session(session_id)
            .await
            .expect("memory ledger should not fail")
    }

    /// Poll until `count` entries for the session left the pending state.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within five seconds.
    pub async fn wait_for_usage(&self, session_id: SessionId, count: usize) -> Vec<UsageRecord> {
        let deadline = tokio::time::Instant::now() + USAGE_WAIT_TIMEOUT;
        loop {
            let records = self.ledger(session_id).await;
            let settled = records
                .iter()
                .filter(|r| r.forward_status != ForwardStatus::Pending)
                .count();
            if records.len() >= count && settled == records.len() {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} settled usage records for {session_id}, have {}",
                records.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Run queued jobs with zero backoff until nothing is runnable.
    ///
    /// Returns the number of attempts made.
    ///
    /// # Panics
    ///
    /// Panics if the memory queue fails.
    pub async fn run_jobs(&self) -> usize {
        let mut attempts = 0;
        while process_next(
            &*self.store,
            &*self.launcher,
            Duration::ZERO,
            TEST_JOB_LEASE,
        )
        .await
        .expect("memory queue should not fail")
        {
            attempts += 1;
        }
        attempts
    }

    /// Stop the reconciler after it has reconciled everything queued.
    ///
    /// Usage emitted afterwards is dropped.
    pub async fn drain(&mut self) {
        self.cancel_token.cancel();
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.join().await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_controller::models::SessionStatus;

    #[tokio::test]
    async fn test_harness_starts_and_drains() {
        let mut harness = TestHarness::builder().build();
        let seed = harness.seed().await;

        let started = harness
            .manager
            .start_session(seed.start_request())
            .await
            .expect("start should succeed");
        harness
            .manager
            .heartbeat(started.session_id, 1.0, None)
            .await
            .expect("heartbeat should succeed");

        harness.drain().await;

        let view = harness
            .manager
            .get_session(started.session_id)
            .await
            .expect("session should exist");
        assert_eq!(view.status, SessionStatus::Active);
        assert_eq!(harness.ledger(started.session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_jobs_launches_agent() {
        let harness = TestHarness::builder().build();
        let seed = harness.seed().await;

        harness
            .manager
            .start_session(seed.start_request())
            .await
            .expect("start should succeed");

        assert_eq!(harness.run_jobs().await, 1);
        assert_eq!(harness.launcher.call_count(), 1);
        assert_eq!(harness.run_jobs().await, 0);
    }
}
