//! Persistence seam.
//!
//! Each concern gets its own trait so that components only receive the
//! access they are allowed to have:
//!
//! - [`SessionStore`] is the only write path for session rows and is handed
//!   to the `SessionManager` alone.
//! - [`UsageLedger`] is append-only and belongs to the reconciliation listener.
//! - [`JobQueue`] belongs to the job dispatcher.
//! - [`AccountDirectory`] is read-mostly lookup of creators and fans.
//!
//! `repositories::PgStore` implements every trait over Postgres and
//! [`memory::MemoryStore`] implements them in-process.

pub mod memory;

use crate::errors::ScError;
use crate::models::{
    Creator, ForwardStatus, Job, JobStatus, NewJob, NewSession, Session, SessionStatus,
    UsageEvent, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CreatorId, FanId, JobId, SessionId, TenantId, UsageEventId};
use std::time::Duration;

/// Result of an atomic minute increment.
#[derive(Debug, Clone, PartialEq)]
pub enum MinutesOutcome {
    /// Counter incremented. `activated` is true when this call moved the
    /// session from `created` to `active`.
    Applied { session: Session, activated: bool },
    NotFound,
    /// Terminal sessions are frozen; nothing was written.
    Terminal(SessionStatus),
}

/// Result of a compare-and-set status change.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Session),
    NotFound,
    /// Current status was not one of the allowed sources.
    Rejected(SessionStatus),
}

/// Session rows. Only the lifecycle manager holds one of these.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session with status `created` and zero minutes.
    async fn insert_session(&self, session: NewSession) -> Result<Session, ScError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, ScError>;

    /// Add `minutes` to the counter as one atomic conditional update,
    /// promoting `created` to `active` in the same write.
    async fn add_minutes(&self, id: SessionId, minutes: f64) -> Result<MinutesOutcome, ScError>;

    /// Move to `to` if the current status is in `from`. `ended_at` is
    /// recorded when supplied.
    async fn transition(
        &self,
        id: SessionId,
        from: &[SessionStatus],
        to: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, ScError>;
}

/// Creator and fan lookups needed by session preconditions.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_creator(&self, id: CreatorId) -> Result<Option<Creator>, ScError>;

    async fn billing_customer_for(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
    ) -> Result<Option<String>, ScError>;

    async fn set_billing_customer(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
        customer_ref: &str,
    ) -> Result<(), ScError>;
}

/// Append-only usage ledger. Quantities are never updated and rows are never
/// deleted; only forward bookkeeping changes.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Persist an event with `forward_status = pending`.
    async fn append(&self, event: &UsageEvent) -> Result<UsageRecord, ScError>;

    async fn mark_forwarded(&self, id: UsageEventId) -> Result<(), ScError>;

    async fn mark_forward_failed(&self, id: UsageEventId, reason: &str) -> Result<(), ScError>;

    /// Entries for one session in the order they were appended.
    async fn list_for_session(&self, session_id: SessionId) -> Result<Vec<UsageRecord>, ScError>;

    /// Oldest first.
    async fn list_by_forward_status(
        &self,
        status: ForwardStatus,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, ScError>;
}

/// Result of a fenced job outcome write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Recorded,
    /// The lease expired and a later claim owns the job now.
    Lost,
}

/// Durable at-least-once job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, ScError>;

    /// Claim the oldest runnable job: `pending` with `available_at` in the
    /// past, or `running` with an expired lease. Increments `attempts`.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, ScError>;

    // Outcome writes are fenced on the claimed `attempt`. They only land while
    // the job is still `running` under that attempt.

    async fn mark_succeeded(&self, id: JobId, attempt: u32) -> Result<LeaseOutcome, ScError>;

    /// Return the job to `pending`, runnable again after `delay`.
    async fn schedule_retry(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        delay: Duration,
    ) -> Result<LeaseOutcome, ScError>;

    async fn mark_exhausted(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<LeaseOutcome, ScError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, ScError>;

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, ScError>;
}

/// Connectivity check used by the readiness probe.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<(), ScError>;
}

/// Upper bound for leases and retry delays.
const MAX_OFFSET_DAYS: i64 = 3650;

/// Convert a lease or delay into a chrono offset, capped at ten years.
pub(crate) fn chrono_offset(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(MAX_OFFSET_DAYS);
    chrono::Duration::from_std(duration)
        .map(|offset| offset.min(cap))
        .unwrap_or(cap)
}
