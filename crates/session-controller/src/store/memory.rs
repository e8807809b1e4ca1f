//! In-process implementation of every store trait.
//!
//! All state sits behind one `tokio::sync::Mutex`, so each trait method is a
//! single critical section with the same atomicity as the conditional SQL
//! updates in `repositories`. Used by the test harness and local runs.

use super::{
    chrono_offset, AccountDirectory, JobQueue, LeaseOutcome, MinutesOutcome, SessionStore,
    StoreHealth, TransitionOutcome, UsageLedger,
};
use crate::errors::ScError;
use crate::models::{
    Creator, ForwardStatus, Job, JobStatus, NewJob, NewSession, Session, SessionStatus,
    UsageEvent, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CreatorId, FanId, JobId, SessionId, TenantId, UsageEventId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    creators: HashMap<CreatorId, Creator>,
    customers: HashMap<(TenantId, FanId), String>,
    usage: Vec<UsageRecord>,
    jobs: Vec<Job>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_appends: AtomicBool,
    failing_appends: AtomicUsize,
    fail_enqueues: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a creator so `find_creator` can see it.
    pub async fn insert_creator(&self, creator: Creator) {
        self.state.lock().await.creators.insert(creator.id, creator);
    }

    /// Make subsequent ledger appends fail with a database error.
    pub fn fail_ledger_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` ledger appends fail, then recover.
    pub fn fail_next_ledger_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Make subsequent job enqueues fail with a database error.
    pub fn fail_job_enqueues(&self, fail: bool) {
        self.fail_enqueues.store(fail, Ordering::SeqCst);
    }

    /// Number of session rows.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Number of job rows.
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Number of ledger rows.
    pub async fn usage_count(&self) -> usize {
        self.state.lock().await.usage.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, new: NewSession) -> Result<Session, ScError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&new.id) {
            return Err(ScError::Database(format!(
                "duplicate key value violates unique constraint: sessions.id = {}",
                new.id
            )));
        }
        if state.sessions.values().any(|s| s.room_id == new.room_id) {
            return Err(ScError::Database(format!(
                "duplicate key value violates unique constraint: sessions.room_id = {}",
                new.room_id
            )));
        }

        let session = Session {
            id: new.id,
            tenant_id: new.tenant_id,
            creator_id: new.creator_id,
            fan_id: new.fan_id,
            room_id: new.room_id,
            status: SessionStatus::Created,
            minutes_consumed: 0.0,
            billing_customer_ref: new.billing_customer_ref,
            metadata: new.metadata,
            created_at: Utc::now(),
            ended_at: None,
        };
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, ScError> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn add_minutes(&self, id: SessionId, minutes: f64) -> Result<MinutesOutcome, ScError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(MinutesOutcome::NotFound);
        };
        if session.status.is_terminal() {
            return Ok(MinutesOutcome::Terminal(session.status));
        }

        let activated = session.status == SessionStatus::Created;
        session.minutes_consumed += minutes;
        session.status = SessionStatus::Active;
        Ok(MinutesOutcome::Applied {
            session: session.clone(),
            activated,
        })
    }

    async fn transition(
        &self,
        id: SessionId,
        from: &[SessionStatus],
        to: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, ScError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !from.contains(&session.status) {
            return Ok(TransitionOutcome::Rejected(session.status));
        }

        session.status = to;
        if ended_at.is_some() {
            session.ended_at = ended_at;
        }
        Ok(TransitionOutcome::Applied(session.clone()))
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn find_creator(&self, id: CreatorId) -> Result<Option<Creator>, ScError> {
        Ok(self.state.lock().await.creators.get(&id).cloned())
    }

    async fn billing_customer_for(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
    ) -> Result<Option<String>, ScError> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .get(&(tenant_id, fan_id))
            .cloned())
    }

    async fn set_billing_customer(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
        customer_ref: &str,
    ) -> Result<(), ScError> {
        self.state
            .lock()
            .await
            .customers
            .insert((tenant_id, fan_id), customer_ref.to_string());
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for MemoryStore {
    async fn append(&self, event: &UsageEvent) -> Result<UsageRecord, ScError> {
        let transient = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.fail_appends.load(Ordering::SeqCst) {
            return Err(ScError::Database("ledger unavailable".to_string()));
        }

        let record = UsageRecord {
            id: UsageEventId::new(),
            session_id: event.session_id,
            tenant_id: event.tenant_id,
            customer_ref: event.customer_ref.clone(),
            metric: event.metric,
            meter_event: event.meter_event.clone(),
            quantity: event.quantity,
            recorded_at: event.recorded_at,
            forward_status: ForwardStatus::Pending,
            forward_error: None,
            forwarded_at: None,
        };
        self.state.lock().await.usage.push(record.clone());
        Ok(record)
    }

    async fn mark_forwarded(&self, id: UsageEventId) -> Result<(), ScError> {
        let mut state = self.state.lock().await;
        let record = state
            .usage
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ScError::NotFound("Usage record not found".to_string()))?;
        record.forward_status = ForwardStatus::Forwarded;
        record.forward_error = None;
        record.forwarded_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_forward_failed(&self, id: UsageEventId, reason: &str) -> Result<(), ScError> {
        let mut state = self.state.lock().await;
        let record = state
            .usage
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ScError::NotFound("Usage record not found".to_string()))?;
        record.forward_status = ForwardStatus::Failed;
        record.forward_error = Some(reason.to_string());
        Ok(())
    }

    async fn list_for_session(&self, session_id: SessionId) -> Result<Vec<UsageRecord>, ScError> {
        Ok(self
            .state
            .lock()
            .await
            .usage
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn list_by_forward_status(
        &self,
        status: ForwardStatus,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, ScError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .await
            .usage
            .iter()
            .filter(|r| r.forward_status == status)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl State {
    /// The job if it is still `running` under `attempt`.
    fn leased_job_mut(&mut self, id: JobId, attempt: u32) -> Result<Option<&mut Job>, ScError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| ScError::NotFound("Job not found".to_string()))?;
        if job.status != JobStatus::Running || job.attempts != attempt {
            return Ok(None);
        }
        Ok(Some(job))
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, ScError> {
        if self.fail_enqueues.load(Ordering::SeqCst) {
            return Err(ScError::Database("job queue unavailable".to_string()));
        }

        let now = Utc::now();
        let id = JobId::new();
        self.state.lock().await.jobs.push(Job {
            id,
            kind: job.kind,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            available_at: now,
            leased_until: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, ScError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let runnable = state.jobs.iter_mut().find(|j| match j.status {
            JobStatus::Pending => j.available_at <= now,
            JobStatus::Running => j.leased_until.is_some_and(|until| until <= now),
            JobStatus::Succeeded | JobStatus::Exhausted => false,
        });

        Ok(runnable.map(|job| {
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.leased_until = Some(now + chrono_offset(lease));
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn mark_succeeded(&self, id: JobId, attempt: u32) -> Result<LeaseOutcome, ScError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.leased_job_mut(id, attempt)? else {
            return Ok(LeaseOutcome::Lost);
        };
        job.status = JobStatus::Succeeded;
        job.leased_until = None;
        job.updated_at = Utc::now();
        Ok(LeaseOutcome::Recorded)
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        delay: Duration,
    ) -> Result<LeaseOutcome, ScError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(job) = state.leased_job_mut(id, attempt)? else {
            return Ok(LeaseOutcome::Lost);
        };
        job.status = JobStatus::Pending;
        job.last_error = Some(error.to_string());
        job.available_at = now + chrono_offset(delay);
        job.leased_until = None;
        job.updated_at = now;
        Ok(LeaseOutcome::Recorded)
    }

    async fn mark_exhausted(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<LeaseOutcome, ScError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.leased_job_mut(id, attempt)? else {
            return Ok(LeaseOutcome::Lost);
        };
        job.status = JobStatus::Exhausted;
        job.last_error = Some(error.to_string());
        job.leased_until = None;
        job.updated_at = Utc::now();
        Ok(LeaseOutcome::Recorded)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, ScError> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, ScError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> Result<(), ScError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::UsageMetric;

    fn new_session() -> NewSession {
        NewSession {
            id: SessionId::new(),
            tenant_id: TenantId::new(),
            creator_id: CreatorId::new(),
            fan_id: FanId::new(),
            room_id: format!("session-{}", SessionId::new()),
            billing_customer_ref: "cus_test".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn usage_for(session: &Session, quantity: f64) -> UsageEvent {
        UsageEvent {
            session_id: session.id,
            tenant_id: session.tenant_id,
            customer_ref: session.billing_customer_ref.clone(),
            metric: UsageMetric::Minutes,
            meter_event: "live_minutes".to_string(),
            quantity,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_starts_created_with_zero_minutes() {
        let store = MemoryStore::new();
        let session = store.insert_session(new_session()).await.unwrap();

        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.minutes_consumed, 0.0);
        assert!(session.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_reused_room() {
        let store = MemoryStore::new();
        let first = new_session();
        let mut second = new_session();
        second.room_id = first.room_id.clone();

        store.insert_session(first).await.unwrap();
        let result = store.insert_session(second).await;
        assert!(matches!(result, Err(ScError::Database(_))));
    }

    #[tokio::test]
    async fn test_add_minutes_activates_once() {
        let store = MemoryStore::new();
        let session = store.insert_session(new_session()).await.unwrap();

        let first = store.add_minutes(session.id, 1.5).await.unwrap();
        let second = store.add_minutes(session.id, 2.0).await.unwrap();

        assert!(matches!(first, MinutesOutcome::Applied { activated: true, .. }));
        assert!(matches!(second, MinutesOutcome::Applied { activated: false, .. }));
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        assert_eq!(stored.minutes_consumed, 3.5);
    }

    #[tokio::test]
    async fn test_add_minutes_on_terminal_is_frozen() {
        let store = MemoryStore::new();
        let session = store.insert_session(new_session()).await.unwrap();
        store
            .transition(
                session.id,
                &[SessionStatus::Created],
                SessionStatus::Cancelled,
                Some(Utc::now()),
            )
            .await
            .unwrap();

        let outcome = store.add_minutes(session.id, 1.0).await.unwrap();
        assert_eq!(outcome, MinutesOutcome::Terminal(SessionStatus::Cancelled));
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.minutes_consumed, 0.0);
    }

    #[tokio::test]
    async fn test_transition_rejects_wrong_source() {
        let store = MemoryStore::new();
        let session = store.insert_session(new_session()).await.unwrap();

        let outcome = store
            .transition(session.id, &[SessionStatus::Active], SessionStatus::Ended, None)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected(SessionStatus::Created));

        let missing = store
            .transition(SessionId::new(), &[SessionStatus::Active], SessionStatus::Ended, None)
            .await
            .unwrap();
        assert_eq!(missing, TransitionOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_ledger_forward_bookkeeping_keeps_quantity() {
        let store = MemoryStore::new();
        let session = store.insert_session(new_session()).await.unwrap();
        let record = store.append(&usage_for(&session, 2.5)).await.unwrap();
        assert_eq!(record.forward_status, ForwardStatus::Pending);

        store
            .mark_forward_failed(record.id, "billing unavailable")
            .await
            .unwrap();

        let failed = store
            .list_by_forward_status(ForwardStatus::Failed, 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        let entry = failed.first().unwrap();
        assert_eq!(entry.quantity, 2.5);
        assert_eq!(entry.forward_error.as_deref(), Some("billing unavailable"));
    }

    #[tokio::test]
    async fn test_claim_respects_availability_and_lease() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(NewJob {
                kind: "agent-start".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
            })
            .await
            .unwrap();

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, JobStatus::Running);

        // Leased, so not claimable again.
        assert!(store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        let outcome = store
            .schedule_retry(id, 1, "agent offline", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Recorded);
        let again = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("agent offline"));

        store
            .schedule_retry(id, 2, "agent offline", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryStore::new();
        store
            .enqueue(NewJob {
                kind: "agent-start".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
            })
            .await
            .unwrap();

        store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        let reclaimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_overwrite_outcome() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(NewJob {
                kind: "agent-start".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
            })
            .await
            .unwrap();

        // First claim's lease lapses while its attempt is still in flight.
        let stale = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
        let fresh = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.attempts, 2);
        assert_eq!(
            store.mark_succeeded(id, fresh.attempts).await.unwrap(),
            LeaseOutcome::Recorded
        );

        assert_eq!(
            store
                .schedule_retry(id, stale.attempts, "agent offline", Duration::ZERO)
                .await
                .unwrap(),
            LeaseOutcome::Lost
        );
        assert_eq!(
            store
                .mark_exhausted(id, stale.attempts, "agent offline")
                .await
                .unwrap(),
            LeaseOutcome::Lost
        );

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_outcome_for_unknown_job_is_not_found() {
        let store = MemoryStore::new();
        let err = store.mark_succeeded(JobId::new(), 1).await.unwrap_err();
        assert!(matches!(err, ScError::NotFound(_)));
    }
}
