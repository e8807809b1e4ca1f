//! Session API handlers.
//!
//! Thin translation between HTTP and the `SessionManager`:
//!
//! - `POST /v1/sessions` - 201 with credentials
//! - `GET /v1/sessions/:id` - 200 with the public view
//! - `POST /v1/sessions/:id/join` - 200 with a fresh join credential
//! - `POST /v1/sessions/:id/heartbeat` - 204
//! - `POST /v1/sessions/:id/terminate` - 204
//! - `POST /v1/sessions/:id/cancel` - 204
//!
//! Bodies are decoded by hand so malformed JSON is a 400 in the standard
//! error envelope rather than the framework's 422.

use crate::errors::ScError;
use crate::models::{
    HeartbeatRequest, JoinCredentialResponse, JoinRequest, SessionView, StartSessionRequest,
    StartSessionResponse,
};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::types::SessionId;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, instrument};

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ScError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "sc.handlers.sessions", error = %e, "Invalid request body");
        ScError::BadRequest("Invalid request body".to_string())
    })
}

fn parse_session_id(raw: &str) -> Result<SessionId, ScError> {
    raw.parse()
        .map_err(|_| ScError::BadRequest("Invalid session id".to_string()))
}

/// Handler for POST /v1/sessions
#[instrument(skip_all, name = "sc.session.start")]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartSessionResponse>), ScError> {
    let request: StartSessionRequest = parse_body(&body)?;
    let response = state.manager.start_session(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Handler for GET /v1/sessions/:id
#[instrument(skip_all, name = "sc.session.get")]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    Ok(Json(state.manager.get_session(session_id).await?))
}

/// Handler for POST /v1/sessions/:id/join
#[instrument(skip_all, name = "sc.session.join")]
pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<JoinCredentialResponse>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let request: JoinRequest = parse_body(&body)?;
    let response = state
        .manager
        .join_credential(session_id, request.role, request.identity.as_deref())
        .await?;
    Ok(Json(response))
}

/// Handler for POST /v1/sessions/:id/heartbeat
#[instrument(skip_all, name = "sc.session.heartbeat")]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let request: HeartbeatRequest = parse_body(&body)?;
    state
        .manager
        .heartbeat(session_id, request.minutes, request.meter_event.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST /v1/sessions/:id/terminate
#[instrument(skip_all, name = "sc.session.terminate")]
pub async fn terminate_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ScError> {
    let session_id = parse_session_id(&session_id)?;
    state.manager.terminate(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST /v1/sessions/:id/cancel
#[instrument(skip_all, name = "sc.session.cancel")]
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ScError> {
    let session_id = parse_session_id(&session_id)?;
    state.manager.cancel_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
