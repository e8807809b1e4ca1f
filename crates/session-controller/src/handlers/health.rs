//! Probe handlers.
//!
//! `/health` answers as long as the process serves HTTP. `/ready` also pings
//! the store.

use crate::models::ReadinessResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

/// Liveness probe. Touches nothing.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe: 200 when the store answers a ping, 503 otherwise.
///
/// The store error is logged, never returned.
#[tracing::instrument(skip_all, name = "sc.health.readiness")]
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    match state.store_health.ping().await {
        Ok(()) => (StatusCode::OK, Json(ReadinessResponse::ready())),
        Err(e) => {
            tracing::warn!(target: "sc.health", error = %e, "Store ping failed, reporting not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse::store_unavailable()),
            )
        }
    }
}
