//! Metrics definitions for the Session Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for Session Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `endpoint`: parameterized paths only, everything else is `/other`
//! - `operation`: fixed by code (start, heartbeat, terminate, cancel, ...)
//! - `outcome`: fixed by code
//! - `shard`: bounded by `RECONCILER_SHARDS`
//!
//! Session ids, room ids and customer references are never labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sc_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.150, 0.200, 0.300, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        // Session start spans three remote calls
        .set_buckets_for_metric(
            Matcher::Prefix("sc_lifecycle_operation".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set lifecycle buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sc_gateway_call".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.000, 2.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set gateway call buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("sc_usage_quantity".to_string()),
            &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 240.0],
        )
        .map_err(|e| format!("Failed to set usage quantity buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `sc_http_requests_total`, `sc_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("sc_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint.clone(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Normalize endpoint path to prevent label cardinality explosion.
fn normalize_endpoint(path: &str) -> String {
    match path {
        "/health" | "/ready" | "/metrics" | "/v1/sessions" => path.to_string(),
        _ => normalize_dynamic_endpoint(path),
    }
}

/// Replace the session id segment with a placeholder.
fn normalize_dynamic_endpoint(path: &str) -> String {
    let Some(rest) = path.strip_prefix("/v1/sessions/") else {
        return "/other".to_string();
    };

    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), None, None) if !id.is_empty() => "/v1/sessions/{id}".to_string(),
        (Some(id), Some(action), None)
            if !id.is_empty() && matches!(action, "join" | "heartbeat" | "terminate" | "cancel") =>
        {
            format!("/v1/sessions/{{id}}/{action}")
        }
        _ => "/other".to_string(),
    }
}

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Record a lifecycle manager operation.
///
/// Metric: `sc_lifecycle_operations_total`, `sc_lifecycle_operation_duration_seconds`
/// Labels: `operation`, `outcome`
///
/// Operations: start, join, heartbeat, terminate, cancel
/// Outcomes: success, or the error kind (`not_found`, `already_terminal`, ...)
pub fn record_lifecycle_operation(operation: &str, outcome: &str, duration: Duration) {
    histogram!("sc_lifecycle_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_lifecycle_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a status change that was applied.
///
/// Metric: `sc_session_transitions_total`
/// Labels: `to`
pub fn record_session_transition(to: &str) {
    counter!("sc_session_transitions_total", "to" => to.to_string()).increment(1);
}

// ============================================================================
// Usage Metrics
// ============================================================================

/// Record a usage event handed to the reconciler.
///
/// Metric: `sc_usage_events_emitted_total`, `sc_usage_quantity`
/// Labels: `flush` ("periodic" or "final")
pub fn record_usage_emitted(flush: &str, quantity: f64) {
    counter!("sc_usage_events_emitted_total", "flush" => flush.to_string()).increment(1);
    histogram!("sc_usage_quantity", "flush" => flush.to_string()).record(quantity);
}

/// Record the outcome of reconciling one usage event.
///
/// Metric: `sc_usage_forwards_total`
/// Labels: `outcome` ("forwarded", "billing_failed", "ledger_failed", "dropped")
pub fn record_usage_forward(outcome: &str) {
    counter!("sc_usage_forwards_total", "outcome" => outcome.to_string()).increment(1);
}

/// Set the number of events waiting on a reconciler shard.
///
/// Metric: `sc_reconciler_queue_depth`
/// Labels: `shard`
pub fn set_reconciler_queue_depth(shard: usize, depth: usize) {
    gauge!("sc_reconciler_queue_depth", "shard" => shard.to_string()).set(depth as f64);
}

// ============================================================================
// Job Metrics
// ============================================================================

/// Record one delivery attempt.
///
/// Metric: `sc_job_attempts_total`
/// Labels: `kind`, `outcome` ("succeeded", "retry", "exhausted", "lease_lost")
pub fn record_job_attempt(kind: &str, outcome: &str) {
    counter!("sc_job_attempts_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a job handed to the queue.
///
/// Metric: `sc_jobs_enqueued_total`
/// Labels: `kind`, `status`
pub fn record_job_enqueued(kind: &str, status: &str) {
    counter!("sc_jobs_enqueued_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Gateway Metrics
// ============================================================================

/// Record a call to an external collaborator.
///
/// Metric: `sc_gateway_calls_total`, `sc_gateway_call_duration_seconds`
/// Labels: `gateway` ("room", "billing", "agent"), `operation`, `status`
pub fn record_gateway_call(gateway: &str, operation: &str, status: &str, duration: Duration) {
    histogram!("sc_gateway_call_duration_seconds",
        "gateway" => gateway.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_gateway_calls_total",
        "gateway" => gateway.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record error by category.
///
/// Metric: `sc_errors_total`
/// Labels: `operation`, `error_type`, `status_code`
pub fn record_error(operation: &str, error_type: &str, status_code: u16) {
    counter!("sc_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string(),
        "status_code" => status_code.to_string()
    )
    .increment(1);
}
