//! Session Controller error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl so the
//! route layer can return them directly. Messages for internal classes are
//! generic; the actual cause is logged server-side.

use crate::models::SessionStatus;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Session Controller error type.
///
/// Maps to HTTP status codes:
/// - NotFound: 404 Not Found
/// - InvalidTransition, AlreadyTerminal: 409 Conflict
/// - BadRequest: 400 Bad Request
/// - UpstreamUnavailable: 503 Service Unavailable
/// - DeliveryExhausted, Database, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum ScError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Illegal state change. Reported, never retried.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// The session already reached `ended` or `cancelled`.
    #[error("Session already terminal ({status})")]
    AlreadyTerminal { status: SessionStatus },

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Room, billing or agent collaborator call failed.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A dispatched job used up every attempt.
    #[error("Delivery exhausted: {0}")]
    DeliveryExhausted(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl ScError {
    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            ScError::NotFound(_) => 404,
            ScError::InvalidTransition { .. } | ScError::AlreadyTerminal { .. } => 409,
            ScError::BadRequest(_) => 400,
            ScError::UpstreamUnavailable(_) => 503,
            ScError::DeliveryExhausted(_) | ScError::Database(_) | ScError::Internal => 500,
        }
    }

    /// Short, bounded label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ScError::NotFound(_) => "not_found",
            ScError::InvalidTransition { .. } => "invalid_transition",
            ScError::AlreadyTerminal { .. } => "already_terminal",
            ScError::BadRequest(_) => "bad_request",
            ScError::UpstreamUnavailable(_) => "upstream_unavailable",
            ScError::DeliveryExhausted(_) => "delivery_exhausted",
            ScError::Database(_) => "database",
            ScError::Internal => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ScError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ScError::NotFound(resource) => (StatusCode::NOT_FOUND, "NOT_FOUND", resource.clone()),
            ScError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", self.to_string())
            }
            ScError::AlreadyTerminal { .. } => {
                (StatusCode::CONFLICT, "ALREADY_TERMINAL", self.to_string())
            }
            ScError::BadRequest(reason) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.clone()),
            ScError::UpstreamUnavailable(reason) => {
                tracing::warn!(target: "sc.availability", reason = %reason, "Upstream unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UPSTREAM_UNAVAILABLE",
                    "A required upstream service is temporarily unavailable".to_string(),
                )
            }
            ScError::DeliveryExhausted(reason) => {
                tracing::error!(target: "sc.dispatcher", reason = %reason, "Delivery exhausted");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DELIVERY_EXHAUSTED",
                    "An internal error occurred".to_string(),
                )
            }
            ScError::Database(err) => {
                tracing::error!(target: "sc.database", error = %err, "Database operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            ScError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// Convert sqlx errors to ScError
impl From<sqlx::Error> for ScError {
    fn from(err: sqlx::Error) -> Self {
        ScError::Database(err.to_string())
    }
}
