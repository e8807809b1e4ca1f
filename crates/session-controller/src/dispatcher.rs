//! Job dispatcher.
//!
//! Jobs are persisted by [`JobDispatcher::enqueue`] and picked up by a pool of
//! polling workers. Delivery is at-least-once: a claim takes a lease, and a
//! worker that dies mid-attempt leaves a job that becomes claimable again once
//! the lease runs out.
//!
//! # Retry policy
//!
//! A failed attempt with attempts remaining goes back to `pending` after
//! `base * 2^(attempt - 1)`. The final failure marks the job `exhausted`.
//! Unknown kinds and undecodable payloads are exhausted on the first attempt.
//!
//! Exhaustion is logged and counted. It never changes the session.
//!
//! # Fencing
//!
//! Outcome writes carry the attempt number of the claim. If the lease ran out
//! mid-attempt and another worker reclaimed the job, the write is rejected and
//! the stale outcome is dropped.

use crate::config::JobSettings;
use crate::errors::ScError;
use crate::models::{AgentStartPayload, Job, NewJob, AGENT_START_JOB_KIND};
use crate::observability::metrics;
use crate::services::AgentLauncher;
use crate::store::{JobQueue, LeaseOutcome};
use common::types::JobId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Largest exponent applied to the retry backoff.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Front door of the job queue.
#[derive(Clone)]
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Persist a job and make it visible to workers.
    ///
    /// # Errors
    ///
    /// - `ScError::BadRequest` if `max_attempts` is zero
    /// - whatever the queue returns if the job could not be persisted
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<JobId, ScError> {
        if max_attempts == 0 {
            return Err(ScError::BadRequest(
                "max_attempts must be greater than zero".to_string(),
            ));
        }

        let result = self
            .queue
            .enqueue(NewJob {
                kind: kind.to_string(),
                payload,
                max_attempts,
            })
            .await;

        match &result {
            Ok(job_id) => {
                debug!(target: "sc.dispatcher", job_id = %job_id, kind, "Job enqueued");
                metrics::record_job_enqueued(kind_label(kind), "success");
            }
            Err(e) => {
                warn!(target: "sc.dispatcher", kind, error = %e, "Failed to enqueue job");
                metrics::record_job_enqueued(kind_label(kind), "error");
            }
        }

        result
    }
}

/// Delay before the attempt after `attempt` (1-based).
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent)
}

fn kind_label(kind: &str) -> &'static str {
    if kind == AGENT_START_JOB_KIND {
        AGENT_START_JOB_KIND
    } else {
        "unknown"
    }
}

enum AttemptFailure {
    /// Worth another attempt if any remain.
    Retryable(String),
    /// Will never succeed.
    Permanent(String),
}

async fn attempt(job: &Job, launcher: &dyn AgentLauncher) -> Result<(), AttemptFailure> {
    if job.kind != AGENT_START_JOB_KIND {
        return Err(AttemptFailure::Permanent(format!(
            "Unknown job kind: {}",
            job.kind
        )));
    }

    let payload: AgentStartPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| AttemptFailure::Permanent(format!("Undecodable payload: {e}")))?;

    launcher
        .launch(&payload)
        .await
        .map_err(|e| AttemptFailure::Retryable(e.to_string()))
}

fn lease_lost(job: &Job, outcome: &'static str) {
    warn!(
        target: "sc.dispatcher",
        job_id = %job.id,
        attempt = job.attempts,
        outcome,
        "Lease lost, dropping outcome"
    );
    metrics::record_job_attempt(kind_label(&job.kind), "lease_lost");
}

async fn exhaust(queue: &dyn JobQueue, job: &Job, reason: &str) -> Result<(), ScError> {
    if queue.mark_exhausted(job.id, job.attempts, reason).await? == LeaseOutcome::Lost {
        lease_lost(job, "exhausted");
        return Ok(());
    }

    let err = ScError::DeliveryExhausted(format!(
        "job {} gave up after {} attempt(s): {reason}",
        job.id, job.attempts
    ));
    error!(
        target: "sc.dispatcher",
        job_id = %job.id,
        kind = %job.kind,
        attempts = job.attempts,
        max_attempts = job.max_attempts,
        error = %err,
        "Job delivery exhausted"
    );
    metrics::record_job_attempt(kind_label(&job.kind), "exhausted");
    Ok(())
}

/// Claim and attempt one job.
///
/// Returns `Ok(false)` when nothing was runnable.
///
/// # Errors
///
/// Returns the queue's error if claiming or recording the outcome failed.
pub async fn process_next(
    queue: &dyn JobQueue,
    launcher: &dyn AgentLauncher,
    retry_backoff: Duration,
    lease: Duration,
) -> Result<bool, ScError> {
    let Some(job) = queue.claim_next(lease).await? else {
        return Ok(false);
    };

    // Reclaimed after the final attempt's lease expired.
    if job.attempts > job.max_attempts {
        exhaust(queue, &job, "lease expired on final attempt").await?;
        return Ok(true);
    }

    match attempt(&job, launcher).await {
        Ok(()) => {
            if queue.mark_succeeded(job.id, job.attempts).await? == LeaseOutcome::Lost {
                lease_lost(&job, "succeeded");
                return Ok(true);
            }
            info!(target: "sc.dispatcher", job_id = %job.id, attempts = job.attempts, "Job succeeded");
            metrics::record_job_attempt(kind_label(&job.kind), "succeeded");
        }
        Err(AttemptFailure::Retryable(reason)) if job.attempts < job.max_attempts => {
            let delay = retry_delay(retry_backoff, job.attempts);
            if queue
                .schedule_retry(job.id, job.attempts, &reason, delay)
                .await?
                == LeaseOutcome::Lost
            {
                lease_lost(&job, "retry");
                return Ok(true);
            }
            warn!(
                target: "sc.dispatcher",
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Job attempt failed, will retry"
            );
            metrics::record_job_attempt(kind_label(&job.kind), "retry");
        }
        Err(AttemptFailure::Retryable(reason) | AttemptFailure::Permanent(reason)) => {
            exhaust(queue, &job, &reason).await?;
        }
    }

    Ok(true)
}

/// Spawn `settings.workers` polling workers.
///
/// Workers finish their current attempt and exit when `cancel_token` fires.
pub fn start_job_workers(
    queue: Arc<dyn JobQueue>,
    launcher: Arc<dyn AgentLauncher>,
    settings: &JobSettings,
    cancel_token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(target: "sc.dispatcher", workers = settings.workers, "Starting job workers");

    (0..settings.workers.max(1))
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let launcher = Arc::clone(&launcher);
            let settings = settings.clone();
            let cancel_token = cancel_token.clone();
            tokio::spawn(
                run_worker(queue, launcher, settings, cancel_token)
                    .instrument(tracing::info_span!("job_worker", worker)),
            )
        })
        .collect()
}

async fn run_worker(
    queue: Arc<dyn JobQueue>,
    launcher: Arc<dyn AgentLauncher>,
    settings: JobSettings,
    cancel_token: CancellationToken,
) {
    loop {
        if cancel_token.is_cancelled() {
            break;
        }

        let processed = process_next(
            &*queue,
            &*launcher,
            settings.retry_backoff,
            settings.lease,
        )
        .await;

        let idle = match processed {
            Ok(true) => false,
            Ok(false) => true,
            Err(e) => {
                warn!(target: "sc.dispatcher", error = %e, "Job queue error");
                true
            }
        };

        if idle {
            tokio::select! {
                () = tokio::time::sleep(settings.poll_interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }
    }

    info!(target: "sc.dispatcher", "Job worker received shutdown signal, exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::services::agent_launcher::mock::MockAgentLauncher;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use common::types::{CreatorId, SessionId};

    const LEASE: Duration = Duration::from_secs(60);

    fn payload() -> serde_json::Value {
        serde_json::to_value(AgentStartPayload {
            session_id: SessionId::new(),
            room_id: "session-abc".to_string(),
            creator_id: CreatorId::new(),
            agent_credential: "agent-token".to_string(),
        })
        .unwrap()
    }

    fn dispatcher(store: &Arc<MemoryStore>) -> JobDispatcher {
        JobDispatcher::new(Arc::clone(store) as Arc<dyn JobQueue>)
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_millis(1000);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(4000));
        assert_eq!(retry_delay(Duration::ZERO, 3), Duration::ZERO);
        // Capped exponent, no overflow
        assert!(retry_delay(base, u32::MAX) >= retry_delay(base, 17));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_zero_attempts() {
        let store = Arc::new(MemoryStore::new());
        let result = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 0)
            .await;

        assert!(matches!(result, Err(ScError::BadRequest(_))));
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_persists_pending_job() {
        let store = Arc::new(MemoryStore::new());
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_process_next_with_empty_queue() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::accepting();

        let processed = process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap();

        assert!(!processed);
        assert_eq!(launcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::accepting();
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        assert!(process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap());

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(launcher.launched().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::failing();
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        for expected_attempts in 1..=2u32 {
            process_next(&*store, &launcher, Duration::ZERO, LEASE)
                .await
                .unwrap();
            let job = store.get_job(job_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, expected_attempts);
            assert!(job.last_error.is_some());
        }

        process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Exhausted);
        assert_eq!(job.attempts, 3);
        assert_eq!(launcher.call_count(), 3);

        // Exhausted jobs are retained and never replayed.
        assert!(!process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap());
        assert_eq!(launcher.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::failing();
        dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        process_next(
            &*store,
            &launcher,
            Duration::from_secs(3600),
            LEASE,
        )
        .await
        .unwrap();

        // Not runnable until the backoff passes.
        assert!(!process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap());
        assert_eq!(launcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_exhausted_immediately() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::accepting();
        let job_id = dispatcher(&store)
            .enqueue("reindex", serde_json::json!({}), 3)
            .await
            .unwrap();

        process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Exhausted);
        assert_eq!(launcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_exhausted_immediately() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::accepting();
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, serde_json::json!({"room": 1}), 3)
            .await
            .unwrap();

        process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Exhausted);
        assert!(job.last_error.unwrap().contains("Undecodable"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockAgentLauncher::accepting();
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        // A worker claims with a zero lease and dies.
        let claimed = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);

        assert!(process_next(&*store, &launcher, Duration::ZERO, LEASE)
            .await
            .unwrap());
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
    }

    /// Launcher whose attempt outlives its zero lease: while it runs, a second
    /// worker reclaims the job and delivers it. Then the slow attempt fails.
    struct OvertakenLauncher {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl AgentLauncher for OvertakenLauncher {
        async fn launch(&self, _payload: &AgentStartPayload) -> Result<(), ScError> {
            let other_worker = MockAgentLauncher::accepting();
            let processed = process_next(&*self.store, &other_worker, Duration::ZERO, LEASE)
                .await
                .unwrap();
            assert!(processed);
            Err(ScError::UpstreamUnavailable("agent pool timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn test_stale_worker_outcome_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        let slow = OvertakenLauncher {
            store: Arc::clone(&store),
        };
        assert!(process_next(&*store, &slow, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap());

        // The reclaiming worker's success stands.
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
        assert!(!process_next(&*store, &slow, Duration::ZERO, LEASE)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_worker_pool_delivers_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let launcher = Arc::new(MockAgentLauncher::failing_times(1));
        let job_id = dispatcher(&store)
            .enqueue(AGENT_START_JOB_KIND, payload(), 3)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let settings = JobSettings {
            max_attempts: 3,
            workers: 2,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::ZERO,
            lease: LEASE,
        };
        let workers = start_job_workers(
            Arc::clone(&store) as Arc<dyn JobQueue>,
            Arc::clone(&launcher) as Arc<dyn AgentLauncher>,
            &settings,
            cancel.clone(),
        );
        assert_eq!(workers.len(), 2);

        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = store.get_job(job_id).await.unwrap().unwrap();
                if job.status == JobStatus::Succeeded {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered.attempts, 2);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(launcher.launched().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_exits_without_waiting_for_poll() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let settings = JobSettings {
            max_attempts: 3,
            workers: 1,
            poll_interval: Duration::from_secs(3600),
            retry_backoff: Duration::ZERO,
            lease: LEASE,
        };
        let workers = start_job_workers(
            Arc::clone(&store) as Arc<dyn JobQueue>,
            Arc::new(MockAgentLauncher::accepting()) as Arc<dyn AgentLauncher>,
            &settings,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
