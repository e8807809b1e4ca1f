//! Session Controller models.
//!
//! Contains the session, usage and job records plus the request/response
//! shapes of the HTTP surface.

use chrono::{DateTime, Utc};
use common::types::{CreatorId, FanId, JobId, SessionId, TenantId, UsageEventId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use common::jwt::ParticipantRole;

/// Job kind for getting the creator's agent into a session room.
pub const AGENT_START_JOB_KIND: &str = "agent-start";

// ============================================================================
// Sessions
// ============================================================================

/// Session status enumeration.
///
/// Legal transitions: `created -> active -> ended` and `created -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Persisted, no heartbeat seen yet.
    Created,

    /// At least one heartbeat was applied.
    Active,

    /// Terminated normally.
    Ended,

    /// Abandoned before it went active.
    Cancelled,
}

impl SessionStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(SessionStatus::Created),
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }

    /// `ended` and `cancelled` are final; the minute counter is frozen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Created, SessionStatus::Active)
                | (SessionStatus::Created, SessionStatus::Cancelled)
                | (SessionStatus::Active, SessionStatus::Ended)
        )
    }

    /// States from which `next` can be reached.
    pub fn sources_of(next: SessionStatus) -> &'static [SessionStatus] {
        match next {
            SessionStatus::Created => &[],
            SessionStatus::Active => &[SessionStatus::Created],
            SessionStatus::Ended => &[SessionStatus::Active],
            SessionStatus::Cancelled => &[SessionStatus::Created],
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One billed real-time call between a creator and a fan.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub creator_id: CreatorId,
    pub fan_id: FanId,
    /// Bound 1:1 to the media room. Never changes after creation.
    pub room_id: String,
    pub status: SessionStatus,
    /// Monotonic while non-terminal, frozen afterwards.
    pub minutes_consumed: f64,
    /// Billing customer reference. Never leaves the service.
    pub billing_customer_ref: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Insert shape for a session; always persisted as `created` with no minutes.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub creator_id: CreatorId,
    pub fan_id: FanId,
    pub room_id: String,
    pub billing_customer_ref: String,
    pub metadata: serde_json::Value,
}

/// Creator persona as seen by the session preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creator {
    pub id: CreatorId,
    pub tenant_id: TenantId,
    pub display_name: String,
}

// ============================================================================
// Usage
// ============================================================================

/// Kind of consumption being metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    Minutes,
    Tokens,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::Minutes => "minutes",
            UsageMetric::Tokens => "tokens",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minutes" => Some(UsageMetric::Minutes),
            "tokens" => Some(UsageMetric::Tokens),
            _ => None,
        }
    }
}

/// A usage quantum emitted by the lifecycle manager, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub customer_ref: String,
    pub metric: UsageMetric,
    pub meter_event: String,
    /// Always > 0.
    pub quantity: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Billing forward state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Pending,
    Forwarded,
    Failed,
}

impl ForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardStatus::Pending => "pending",
            ForwardStatus::Forwarded => "forwarded",
            ForwardStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ForwardStatus::Pending),
            "forwarded" => Some(ForwardStatus::Forwarded),
            "failed" => Some(ForwardStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted ledger entry. Quantity and meter event are immutable; only the
/// forward bookkeeping changes.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub id: UsageEventId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub customer_ref: String,
    pub metric: UsageMetric,
    pub meter_event: String,
    pub quantity: f64,
    pub recorded_at: DateTime<Utc>,
    pub forward_status: ForwardStatus,
    pub forward_error: Option<String>,
    pub forwarded_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Delivery state of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (first attempt or a scheduled retry).
    Pending,
    /// Claimed by a worker under a lease.
    Running,
    Succeeded,
    /// Every attempt failed. Retained, never replayed.
    Exhausted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Exhausted => "exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "exhausted" => Some(JobStatus::Exhausted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Exhausted)
    }
}

/// Durable work item.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Attempts started so far, including the one in flight.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enqueue shape for a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

/// Payload of an `agent-start` job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStartPayload {
    pub session_id: SessionId,
    pub room_id: String,
    pub creator_id: CreatorId,
    /// Join credential minted for the agent participant.
    pub agent_credential: String,
}

impl fmt::Debug for AgentStartPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentStartPayload")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creator_id", &self.creator_id)
            .field("agent_credential", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// HTTP shapes
// ============================================================================

/// Request body for `POST /v1/sessions`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub tenant_id: TenantId,
    pub creator_id: CreatorId,
    pub fan_id: FanId,
    /// Payment method to validate with a zero-amount authorization.
    pub payment_method_id: String,
    pub customer_email: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Response body for `POST /v1/sessions`.
#[derive(Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub room_id: String,
    pub fan_credential: String,
    pub agent_credential: String,
}

impl fmt::Debug for StartSessionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartSessionResponse")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("fan_credential", &"[REDACTED]")
            .field("agent_credential", &"[REDACTED]")
            .finish()
    }
}

/// Public view of a session. Omits the billing customer reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub creator_id: CreatorId,
    pub fan_id: FanId,
    pub room_id: String,
    pub status: SessionStatus,
    pub minutes_consumed: f64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            tenant_id: session.tenant_id,
            creator_id: session.creator_id,
            fan_id: session.fan_id,
            room_id: session.room_id.clone(),
            status: session.status,
            minutes_consumed: session.minutes_consumed,
            metadata: session.metadata.clone(),
            created_at: session.created_at,
            ended_at: session.ended_at,
        }
    }
}

/// Request body for `POST /v1/sessions/:id/heartbeat`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    /// Minutes elapsed since the previous heartbeat. Must be > 0.
    pub minutes: f64,
    /// Overrides the configured periodic meter event.
    #[serde(default)]
    pub meter_event: Option<String>,
}

/// Request body for `POST /v1/sessions/:id/join`.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub role: ParticipantRole,
    /// Participant identity in the room. Derived from the session when absent.
    #[serde(default)]
    pub identity: Option<String>,
}

/// Response body for `POST /v1/sessions/:id/join`.
#[derive(Clone, Serialize, Deserialize)]
pub struct JoinCredentialResponse {
    pub session_id: SessionId,
    pub room_id: String,
    pub credential: String,
}

impl fmt::Debug for JoinCredentialResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinCredentialResponse")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

/// Readiness check response.
///
/// Returned by the `/ready` endpoint (readiness probe).
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// Service readiness status ("ready" or "not_ready").
    pub status: &'static str,

    /// Store connectivity status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<&'static str>,

    /// Error message (generic, no infrastructure details).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadinessResponse {
    pub fn ready() -> Self {
        Self {
            status: "ready",
            database: Some("healthy"),
            error: None,
        }
    }

    pub fn store_unavailable() -> Self {
        Self {
            status: "not_ready",
            database: Some("unhealthy"),
            error: Some("Service dependencies unavailable".to_string()),
        }
    }
}
