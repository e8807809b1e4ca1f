//! Session Controller
//!
//! Entry point for the live session backend. Serves the session API, runs the
//! usage reconciliation listener and the agent-start job workers.

use common::config::{LogFormat, ObservabilityConfig};
use common::secret::ExposeSecret;
use session_controller::config::{Config, DEFAULT_LOG_LEVEL};
use session_controller::dispatcher::{start_job_workers, JobDispatcher};
use session_controller::lifecycle::{Collaborators, LifecycleSettings, SessionManager};
use session_controller::observability;
use session_controller::reconciler::ReconciliationListener;
use session_controller::repositories::PgStore;
use session_controller::routes::{self, AppState};
use session_controller::services::{HttpAgentLauncher, LiveRoomClient, StripeBillingClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_env() {
        Ok(config) => {
            observability::init_tracing(&config.observability);
            config
        }
        Err(e) => {
            observability::init_tracing(&ObservabilityConfig {
                log_level: DEFAULT_LOG_LEVEL.to_string(),
                log_format: LogFormat::Text,
            });
            error!(target: "sc.startup", error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };

    info!(
        target: "sc.startup",
        bind_address = %config.bind_address,
        reconciler_shards = config.reconciler_shards,
        job_workers = config.jobs.workers,
        job_max_attempts = config.jobs.max_attempts,
        "Configuration loaded successfully"
    );

    let metrics_handle = observability::metrics::init_metrics_recorder().map_err(|e| {
        error!(target: "sc.startup", error = %e, "Failed to initialize metrics recorder");
        e
    })?;

    info!(target: "sc.startup", "Connecting to database...");
    let db_url_with_timeout = add_query_timeout(
        config.database.postgres_url.expose_secret(),
        config.database.statement_timeout_secs,
    );
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!(target: "sc.startup", error = %e, "Failed to connect to database");
            e
        })?;

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            error!(target: "sc.startup", error = %e, "Failed to run migrations");
            e
        })?;
    info!(target: "sc.startup", "Database connection established");

    let store = Arc::new(PgStore::new(db_pool));
    let rooms = Arc::new(LiveRoomClient::new(&config.room)?);
    let billing = Arc::new(StripeBillingClient::new(&config.billing)?);
    let launcher = Arc::new(HttpAgentLauncher::new(&config.agent_launcher_url)?);

    let cancel_token = CancellationToken::new();

    let (usage, reconciler) = ReconciliationListener::new(store.clone(), billing.clone())
        .spawn(config.reconciler_shards, cancel_token.child_token());

    let workers = start_job_workers(
        store.clone(),
        launcher,
        &config.jobs,
        cancel_token.child_token(),
    );

    let manager = Arc::new(SessionManager::new(
        Collaborators {
            sessions: store.clone(),
            accounts: store.clone(),
            rooms,
            billing,
            dispatcher: JobDispatcher::new(store.clone()),
            usage,
        },
        LifecycleSettings::from_config(&config),
    ));

    let state = Arc::new(AppState {
        manager,
        store_health: store,
    });
    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(target: "sc.startup", error = %e, "Invalid bind address");
        e
    })?;

    info!(target: "sc.startup", %addr, "Session Controller listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.drain_seconds))
        .await?;

    // HTTP is closed, nothing emits usage any more. Drain and stop background work.
    cancel_token.cancel();
    reconciler.join().await;
    for worker in workers {
        if let Err(e) = worker.await {
            error!(target: "sc.startup", error = %e, "Job worker panicked");
        }
    }

    info!(target: "sc.startup", "Session Controller shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and the drain period is complete.
async fn shutdown_signal(drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!(target: "sc.startup", "Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!(target: "sc.startup", error = %e, "Failed to listen for SIGINT"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(target: "sc.startup", "Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!(target: "sc.startup", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    if drain_seconds > 0 {
        warn!(target: "sc.startup", drain_seconds, "Draining connections...");
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!(target: "sc.startup", "Drain period complete");
    } else {
        info!(target: "sc.startup", "Skipping drain period (SC_DRAIN_SECONDS=0)");
    }
}

/// Adds statement_timeout to the database URL.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}options=-c%20statement_timeout%3D{timeout_secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_query_timeout() {
        assert_eq!(
            add_query_timeout("postgresql://db/live", 5),
            "postgresql://db/live?options=-c%20statement_timeout%3D5s"
        );
        assert_eq!(
            add_query_timeout("postgresql://db/live?sslmode=require", 10),
            "postgresql://db/live?sslmode=require&options=-c%20statement_timeout%3D10s"
        );
    }
}
