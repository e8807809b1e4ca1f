//! HTTP routes for the Session Controller.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::lifecycle::SessionManager;
use crate::middleware::http_metrics_middleware;
use crate::store::StoreHealth;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Per-request timeout.
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle manager. The only path to session writes.
    pub manager: Arc<SessionManager>,

    /// Store connectivity check for readiness.
    pub store_health: Arc<dyn StoreHealth>,
}

/// Build the application routes.
///
/// - `/health`, `/ready` - probes
/// - `/metrics` - Prometheus scrape endpoint
/// - `/v1/sessions` and `/v1/sessions/:id[/join|/heartbeat|/terminate|/cancel]`
/// - TraceLayer, 30 second timeout, HTTP metrics middleware (outermost)
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let session_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/v1/sessions", post(handlers::start_session))
        .route("/v1/sessions/:id", get(handlers::get_session))
        .route("/v1/sessions/:id/join", post(handlers::join_session))
        .route("/v1/sessions/:id/heartbeat", post(handlers::heartbeat))
        .route(
            "/v1/sessions/:id/terminate",
            post(handlers::terminate_session),
        )
        .route("/v1/sessions/:id/cancel", post(handlers::cancel_session))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer (innermost)
    // 2. TraceLayer
    // 3. http_metrics_middleware - records every response (outermost)
    session_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            REQUEST_TIMEOUT_SECONDS,
        )))
        .layer(middleware::from_fn(http_metrics_middleware))
}
