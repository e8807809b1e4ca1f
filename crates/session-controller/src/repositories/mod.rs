//! Repository layer for database operations.
//!
//! Each repository is a set of static methods over `&PgPool`. [`PgStore`]
//! owns the pool and exposes the repositories through the `store` traits.

mod accounts;
mod jobs;
mod sessions;
mod usage_records;

pub use accounts::AccountsRepository;
pub use jobs::JobsRepository;
pub use sessions::SessionsRepository;
pub use usage_records::UsageRecordsRepository;

use crate::errors::ScError;
use crate::models::{
    Creator, ForwardStatus, Job, JobStatus, NewJob, NewSession, Session, SessionStatus,
    UsageEvent, UsageRecord,
};
use crate::store::{
    AccountDirectory, JobQueue, LeaseOutcome, MinutesOutcome, SessionStore, StoreHealth,
    TransitionOutcome, UsageLedger,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CreatorId, FanId, JobId, SessionId, TenantId, UsageEventId};
use sqlx::PgPool;
use std::time::Duration;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: NewSession) -> Result<Session, ScError> {
        SessionsRepository::insert(&self.pool, session).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, ScError> {
        SessionsRepository::get(&self.pool, id).await
    }

    async fn add_minutes(&self, id: SessionId, minutes: f64) -> Result<MinutesOutcome, ScError> {
        SessionsRepository::add_minutes(&self.pool, id, minutes).await
    }

    async fn transition(
        &self,
        id: SessionId,
        from: &[SessionStatus],
        to: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, ScError> {
        SessionsRepository::transition(&self.pool, id, from, to, ended_at).await
    }
}

#[async_trait]
impl AccountDirectory for PgStore {
    async fn find_creator(&self, id: CreatorId) -> Result<Option<Creator>, ScError> {
        AccountsRepository::find_creator(&self.pool, id).await
    }

    async fn billing_customer_for(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
    ) -> Result<Option<String>, ScError> {
        AccountsRepository::billing_customer_for(&self.pool, tenant_id, fan_id).await
    }

    async fn set_billing_customer(
        &self,
        tenant_id: TenantId,
        fan_id: FanId,
        customer_ref: &str,
    ) -> Result<(), ScError> {
        AccountsRepository::set_billing_customer(&self.pool, tenant_id, fan_id, customer_ref).await
    }
}

#[async_trait]
impl UsageLedger for PgStore {
    async fn append(&self, event: &UsageEvent) -> Result<UsageRecord, ScError> {
        UsageRecordsRepository::append(&self.pool, event).await
    }

    async fn mark_forwarded(&self, id: UsageEventId) -> Result<(), ScError> {
        UsageRecordsRepository::mark_forwarded(&self.pool, id).await
    }

    async fn mark_forward_failed(&self, id: UsageEventId, reason: &str) -> Result<(), ScError> {
        UsageRecordsRepository::mark_forward_failed(&self.pool, id, reason).await
    }

    async fn list_for_session(&self, session_id: SessionId) -> Result<Vec<UsageRecord>, ScError> {
        UsageRecordsRepository::list_for_session(&self.pool, session_id).await
    }

    async fn list_by_forward_status(
        &self,
        status: ForwardStatus,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, ScError> {
        UsageRecordsRepository::list_by_forward_status(&self.pool, status, limit).await
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, ScError> {
        JobsRepository::enqueue(&self.pool, job).await
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, ScError> {
        JobsRepository::claim_next(&self.pool, lease).await
    }

    async fn mark_succeeded(&self, id: JobId, attempt: u32) -> Result<LeaseOutcome, ScError> {
        JobsRepository::mark_succeeded(&self.pool, id, attempt).await
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        delay: Duration,
    ) -> Result<LeaseOutcome, ScError> {
        JobsRepository::schedule_retry(&self.pool, id, attempt, error, delay).await
    }

    async fn mark_exhausted(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<LeaseOutcome, ScError> {
        JobsRepository::mark_exhausted(&self.pool, id, attempt, error).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, ScError> {
        JobsRepository::get(&self.pool, id).await
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, ScError> {
        JobsRepository::list_by_status(&self.pool, status, limit).await
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> Result<(), ScError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
