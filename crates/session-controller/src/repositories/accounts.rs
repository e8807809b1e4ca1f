//! Creator and fan directory repository.

use crate::errors::ScError;
use crate::models::Creator;
use common::types::{CreatorId, FanId, TenantId};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct CreatorRow {
    creator_id: Uuid,
    tenant_id: Uuid,
    display_name: String,
}

/// Repository for creators and fans.
pub struct AccountsRepository;

impl AccountsRepository {
    #[instrument(skip_all, fields(creator_id = %id))]
    pub async fn find_creator(pool: &PgPool, id: CreatorId) -> Result<Option<Creator>, ScError> {
        let row: Option<CreatorRow> = sqlx::query_as(
            "SELECT creator_id, tenant_id, display_name FROM creators WHERE creator_id = $1",
        )
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| Creator {
            id: CreatorId(r.creator_id),
            tenant_id: TenantId(r.tenant_id),
            display_name: r.display_name,
        }))
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, fan_id = %fan_id))]
    pub async fn billing_customer_for(
        pool: &PgPool,
        tenant_id: TenantId,
        fan_id: FanId,
    ) -> Result<Option<String>, ScError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT billing_customer_ref FROM fans WHERE tenant_id = $1 AND fan_id = $2",
        )
        .bind(tenant_id.0)
        .bind(fan_id.0)
        .fetch_optional(pool)
        .await?;

        Ok(row.and_then(|(customer_ref,)| customer_ref))
    }

    /// Upsert the fan's billing customer reference.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, fan_id = %fan_id))]
    pub async fn set_billing_customer(
        pool: &PgPool,
        tenant_id: TenantId,
        fan_id: FanId,
        customer_ref: &str,
    ) -> Result<(), ScError> {
        sqlx::query(
            r#"
            INSERT INTO fans (tenant_id, fan_id, billing_customer_ref)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, fan_id) DO UPDATE
            SET billing_customer_ref = EXCLUDED.billing_customer_ref,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id.0)
        .bind(fan_id.0)
        .bind(customer_ref)
        .execute(pool)
        .await?;

        Ok(())
    }
}
