//! Job queue repository.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never pick the
//! same row. A claim takes a lease; a worker that dies mid-attempt leaves a
//! `running` row whose lease expires and becomes claimable again.

use crate::errors::ScError;
use crate::models::{Job, JobStatus, NewJob};
use crate::store::{chrono_offset, LeaseOutcome};
use chrono::{DateTime, Utc};
use common::types::JobId;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, kind, payload, status, attempts, max_attempts, last_error, \
     available_at, leased_until, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    available_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = ScError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            tracing::error!(target: "sc.repository.jobs", status = %row.status, "Unknown job status in store");
            ScError::Internal
        })?;

        Ok(Job {
            id: JobId(row.job_id),
            kind: row.kind,
            payload: row.payload,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            last_error: row.last_error,
            available_at: row.available_at,
            leased_until: row.leased_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for the job queue.
pub struct JobsRepository;

impl JobsRepository {
    #[instrument(skip_all, fields(kind = %job.kind))]
    pub async fn enqueue(pool: &PgPool, job: NewJob) -> Result<JobId, ScError> {
        let max_attempts = i32::try_from(job.max_attempts)
            .map_err(|_| ScError::BadRequest("max_attempts out of range".to_string()))?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (job_id, kind, payload, status, attempts, max_attempts, available_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, NOW())
            RETURNING job_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(max_attempts)
        .fetch_one(pool)
        .await?;

        Ok(JobId(id))
    }

    /// Claim the oldest runnable job and take a lease on it.
    #[instrument(skip_all)]
    pub async fn claim_next(pool: &PgPool, lease: Duration) -> Result<Option<Job>, ScError> {
        let lease_until = Utc::now() + chrono_offset(lease);
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT job_id
                FROM jobs
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'running' AND leased_until <= NOW())
                ORDER BY available_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running',
                attempts = j.attempts + 1,
                leased_until = $1,
                updated_at = NOW()
            FROM next
            WHERE j.job_id = next.job_id
            RETURNING j.job_id, j.kind, j.payload, j.status, j.attempts, j.max_attempts,
                      j.last_error, j.available_at, j.leased_until, j.created_at, j.updated_at
            "#,
        )
        .bind(lease_until)
        .fetch_optional(pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    // Outcome writes match on `status = 'running'` and the claimed attempt.
    // Zero rows means a later claim owns the job, or the id is unknown.

    #[instrument(skip_all, fields(job_id = %id, attempt = attempt))]
    pub async fn mark_succeeded(
        pool: &PgPool,
        id: JobId,
        attempt: u32,
    ) -> Result<LeaseOutcome, ScError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded', leased_until = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(id.0)
        .bind(attempt_param(attempt))
        .execute(pool)
        .await?;

        Self::fenced(pool, id, result.rows_affected()).await
    }

    #[instrument(skip_all, fields(job_id = %id, attempt = attempt))]
    pub async fn schedule_retry(
        pool: &PgPool,
        id: JobId,
        attempt: u32,
        error: &str,
        delay: Duration,
    ) -> Result<LeaseOutcome, ScError> {
        let available_at = Utc::now() + chrono_offset(delay);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                last_error = $3,
                available_at = $4,
                leased_until = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(id.0)
        .bind(attempt_param(attempt))
        .bind(error)
        .bind(available_at)
        .execute(pool)
        .await?;

        Self::fenced(pool, id, result.rows_affected()).await
    }

    #[instrument(skip_all, fields(job_id = %id, attempt = attempt))]
    pub async fn mark_exhausted(
        pool: &PgPool,
        id: JobId,
        attempt: u32,
        error: &str,
    ) -> Result<LeaseOutcome, ScError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'exhausted', last_error = $3, leased_until = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status = 'running' AND attempts = $2
            "#,
        )
        .bind(id.0)
        .bind(attempt_param(attempt))
        .bind(error)
        .execute(pool)
        .await?;

        Self::fenced(pool, id, result.rows_affected()).await
    }

    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn get(pool: &PgPool, id: JobId) -> Result<Option<Job>, ScError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");

        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id.0)
            .fetch_optional(pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip_all, fields(status = %status.as_str()))]
    pub async fn list_by_status(
        pool: &PgPool,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<Job>, ScError> {
        let query =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY seq LIMIT $2");

        let rows: Vec<JobRow> = sqlx::query_as(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn fenced(pool: &PgPool, id: JobId, rows_affected: u64) -> Result<LeaseOutcome, ScError> {
        if rows_affected > 0 {
            return Ok(LeaseOutcome::Recorded);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT job_id FROM jobs WHERE job_id = $1")
            .bind(id.0)
            .fetch_optional(pool)
            .await?;
        match exists {
            Some(_) => Ok(LeaseOutcome::Lost),
            None => Err(ScError::NotFound("Job not found".to_string())),
        }
    }
}

/// `attempts` is an INTEGER column.
fn attempt_param(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}
