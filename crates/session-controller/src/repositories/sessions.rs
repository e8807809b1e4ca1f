//! Sessions repository.
//!
//! # Security
//!
//! - All queries use parameterized statements (SQL injection safe)
//! - Billing customer references are never logged
//! - Counter increments and status changes are single conditional updates,
//!   so concurrent heartbeats never lose minutes

use crate::errors::ScError;
use crate::models::{NewSession, Session, SessionStatus};
use crate::store::{MinutesOutcome, TransitionOutcome};
use chrono::{DateTime, Utc};
use common::types::SessionId;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, tenant_id, creator_id, fan_id, room_id, status, \
     minutes_consumed, billing_customer_ref, metadata, created_at, ended_at";

/// Database row for a session.
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: Uuid,
    tenant_id: Uuid,
    creator_id: Uuid,
    fan_id: Uuid,
    room_id: String,
    status: String,
    minutes_consumed: f64,
    billing_customer_ref: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

/// Row returned by the minute increment.
#[derive(Debug, sqlx::FromRow)]
struct IncrementRow {
    #[sqlx(flatten)]
    session: SessionRow,
    previous_status: String,
}

pub(crate) fn parse_status(value: &str) -> Result<SessionStatus, ScError> {
    SessionStatus::parse(value).ok_or_else(|| {
        tracing::error!(target: "sc.repository.sessions", status = %value, "Unknown session status in store");
        ScError::Internal
    })
}

impl TryFrom<SessionRow> for Session {
    type Error = ScError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: SessionId(row.session_id),
            tenant_id: row.tenant_id.into(),
            creator_id: row.creator_id.into(),
            fan_id: row.fan_id.into(),
            room_id: row.room_id,
            status: parse_status(&row.status)?,
            minutes_consumed: row.minutes_consumed,
            billing_customer_ref: row.billing_customer_ref,
            metadata: row.metadata,
            created_at: row.created_at,
            ended_at: row.ended_at,
        })
    }
}

/// Repository for session rows.
pub struct SessionsRepository;

impl SessionsRepository {
    /// Insert a session in `created` status.
    #[instrument(skip_all, fields(session_id = %session.id, room_id = %session.room_id))]
    pub async fn insert(pool: &PgPool, session: NewSession) -> Result<Session, ScError> {
        let query = format!(
            r#"
            INSERT INTO sessions
                (session_id, tenant_id, creator_id, fan_id, room_id, status,
                 minutes_consumed, billing_customer_ref, metadata)
            VALUES ($1, $2, $3, $4, $5, 'created', 0, $6, $7)
            RETURNING {SESSION_COLUMNS}
            "#
        );

        let row: SessionRow = sqlx::query_as(&query)
            .bind(session.id.0)
            .bind(session.tenant_id.0)
            .bind(session.creator_id.0)
            .bind(session.fan_id.0)
            .bind(&session.room_id)
            .bind(&session.billing_customer_ref)
            .bind(&session.metadata)
            .fetch_one(pool)
            .await?;

        row.try_into()
    }

    /// Fetch a session by id.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn get(pool: &PgPool, id: SessionId) -> Result<Option<Session>, ScError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1");

        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(id.0)
            .fetch_optional(pool)
            .await?;

        row.map(Session::try_from).transpose()
    }

    /// Atomically add minutes and promote `created` to `active`.
    ///
    /// The row lock in the CTE serializes concurrent increments on the same
    /// session; the status guard keeps terminal sessions frozen.
    #[instrument(skip_all, fields(session_id = %id, minutes = minutes))]
    pub async fn add_minutes(
        pool: &PgPool,
        id: SessionId,
        minutes: f64,
    ) -> Result<MinutesOutcome, ScError> {
        let row: Option<IncrementRow> = sqlx::query_as(
            r#"
            WITH prev AS (
                SELECT session_id, status
                FROM sessions
                WHERE session_id = $1
                FOR UPDATE
            )
            UPDATE sessions s
            SET minutes_consumed = s.minutes_consumed + $2,
                status = CASE WHEN s.status = 'created' THEN 'active' ELSE s.status END
            FROM prev
            WHERE s.session_id = prev.session_id
              AND s.status IN ('created', 'active')
            RETURNING s.session_id, s.tenant_id, s.creator_id, s.fan_id, s.room_id,
                      s.status, s.minutes_consumed, s.billing_customer_ref, s.metadata,
                      s.created_at, s.ended_at, prev.status AS previous_status
            "#,
        )
        .bind(id.0)
        .bind(minutes)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            let activated = row.previous_status == SessionStatus::Created.as_str();
            return Ok(MinutesOutcome::Applied {
                session: row.session.try_into()?,
                activated,
            });
        }

        match Self::current_status(pool, id).await? {
            None => Ok(MinutesOutcome::NotFound),
            Some(status) => Ok(MinutesOutcome::Terminal(status)),
        }
    }

    /// Compare-and-set the status.
    #[instrument(skip_all, fields(session_id = %id, to = %to))]
    pub async fn transition(
        pool: &PgPool,
        id: SessionId,
        from: &[SessionStatus],
        to: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, ScError> {
        let sources: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            r#"
            UPDATE sessions
            SET status = $2,
                ended_at = COALESCE($3, ended_at)
            WHERE session_id = $1
              AND status = ANY($4)
            RETURNING {SESSION_COLUMNS}
            "#
        );

        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(id.0)
            .bind(to.as_str())
            .bind(ended_at)
            .bind(&sources)
            .fetch_optional(pool)
            .await?;

        if let Some(row) = row {
            return Ok(TransitionOutcome::Applied(row.try_into()?));
        }

        match Self::current_status(pool, id).await? {
            None => Ok(TransitionOutcome::NotFound),
            Some(status) => Ok(TransitionOutcome::Rejected(status)),
        }
    }

    async fn current_status(pool: &PgPool, id: SessionId) -> Result<Option<SessionStatus>, ScError> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM sessions WHERE session_id = $1")
                .bind(id.0)
                .fetch_optional(pool)
                .await?;

        status.map(|(s,)| parse_status(&s)).transpose()
    }
}
