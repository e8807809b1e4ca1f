//! Usage ledger repository.
//!
//! Rows are appended once and never deleted. Only `forward_status`,
//! `forward_error` and `forwarded_at` are ever updated; a trigger in the
//! schema rejects anything else.

use crate::errors::ScError;
use crate::models::{ForwardStatus, UsageEvent, UsageMetric, UsageRecord};
use chrono::{DateTime, Utc};
use common::types::{SessionId, UsageEventId};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

const USAGE_COLUMNS: &str = "usage_id, session_id, tenant_id, customer_ref, metric, \
     meter_event, quantity, recorded_at, forward_status, forward_error, forwarded_at";

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    usage_id: Uuid,
    session_id: Uuid,
    tenant_id: Uuid,
    customer_ref: String,
    metric: String,
    meter_event: String,
    quantity: f64,
    recorded_at: DateTime<Utc>,
    forward_status: String,
    forward_error: Option<String>,
    forwarded_at: Option<DateTime<Utc>>,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = ScError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        let metric = UsageMetric::parse(&row.metric).ok_or_else(|| {
            tracing::error!(target: "sc.repository.usage", metric = %row.metric, "Unknown usage metric in store");
            ScError::Internal
        })?;
        let forward_status = ForwardStatus::parse(&row.forward_status).ok_or_else(|| {
            tracing::error!(target: "sc.repository.usage", status = %row.forward_status, "Unknown forward status in store");
            ScError::Internal
        })?;

        Ok(UsageRecord {
            id: UsageEventId(row.usage_id),
            session_id: SessionId(row.session_id),
            tenant_id: row.tenant_id.into(),
            customer_ref: row.customer_ref,
            metric,
            meter_event: row.meter_event,
            quantity: row.quantity,
            recorded_at: row.recorded_at,
            forward_status,
            forward_error: row.forward_error,
            forwarded_at: row.forwarded_at,
        })
    }
}

/// Repository for the usage ledger.
pub struct UsageRecordsRepository;

impl UsageRecordsRepository {
    /// Append an event as a `pending` ledger entry.
    #[instrument(skip_all, fields(session_id = %event.session_id, meter_event = %event.meter_event))]
    pub async fn append(pool: &PgPool, event: &UsageEvent) -> Result<UsageRecord, ScError> {
        let query = format!(
            r#"
            INSERT INTO usage_records
                (usage_id, session_id, tenant_id, customer_ref, metric, meter_event,
                 quantity, recorded_at, forward_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
            RETURNING {USAGE_COLUMNS}
            "#
        );

        let row: UsageRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(event.session_id.0)
            .bind(event.tenant_id.0)
            .bind(&event.customer_ref)
            .bind(event.metric.as_str())
            .bind(&event.meter_event)
            .bind(event.quantity)
            .bind(event.recorded_at)
            .fetch_one(pool)
            .await?;

        row.try_into()
    }

    #[instrument(skip_all, fields(usage_id = %id))]
    pub async fn mark_forwarded(pool: &PgPool, id: UsageEventId) -> Result<(), ScError> {
        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET forward_status = 'forwarded', forward_error = NULL, forwarded_at = NOW()
            WHERE usage_id = $1
            "#,
        )
        .bind(id.0)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ScError::NotFound("Usage record not found".to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(usage_id = %id))]
    pub async fn mark_forward_failed(
        pool: &PgPool,
        id: UsageEventId,
        reason: &str,
    ) -> Result<(), ScError> {
        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET forward_status = 'failed', forward_error = $2
            WHERE usage_id = $1
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ScError::NotFound("Usage record not found".to_string()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn list_for_session(
        pool: &PgPool,
        session_id: SessionId,
    ) -> Result<Vec<UsageRecord>, ScError> {
        let query = format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE session_id = $1 ORDER BY seq"
        );

        let rows: Vec<UsageRow> = sqlx::query_as(&query)
            .bind(session_id.0)
            .fetch_all(pool)
            .await?;

        rows.into_iter().map(UsageRecord::try_from).collect()
    }

    #[instrument(skip_all, fields(status = %status.as_str()))]
    pub async fn list_by_forward_status(
        pool: &PgPool,
        status: ForwardStatus,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, ScError> {
        let query = format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE forward_status = $1 ORDER BY seq LIMIT $2"
        );

        let rows: Vec<UsageRow> = sqlx::query_as(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?;

        rows.into_iter().map(UsageRecord::try_from).collect()
    }
}
