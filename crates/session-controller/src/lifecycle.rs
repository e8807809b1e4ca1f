//! Session lifecycle manager.
//!
//! Owns the session state machine:
//!
//! ```text
//! created ──heartbeat──▶ active ──terminate──▶ ended
//!    │
//!    └──cancel or terminate──▶ cancelled
//! ```
//!
//! `SessionManager` is the only holder of a [`SessionStore`], so every session
//! write in the process goes through it. Minute increments and status changes
//! are single conditional writes in the store; concurrent heartbeats never
//! lose updates and two terminations of one session cannot both win.
//!
//! Usage events leave through a [`UsageEmitter`] and are reconciled in the
//! background, so heartbeats and terminations never wait on billing.

use crate::config::Config;
use crate::dispatcher::JobDispatcher;
use crate::errors::ScError;
use crate::models::{
    AgentStartPayload, JoinCredentialResponse, NewSession, ParticipantRole, Session,
    SessionStatus, SessionView, StartSessionRequest, StartSessionResponse, UsageEvent, UsageMetric,
    AGENT_START_JOB_KIND,
};
use crate::observability::metrics;
use crate::reconciler::UsageEmitter;
use crate::services::room_gateway::participant_identity;
use crate::services::{BillingGateway, RoomGateway};
use crate::store::{AccountDirectory, MinutesOutcome, SessionStore, TransitionOutcome};
use chrono::Utc;
use common::types::{SessionId, TenantId};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Random bytes in a room identifier suffix.
const ROOM_ID_RANDOM_BYTES: usize = 16;

/// Prefix of every room identifier.
pub const ROOM_ID_PREFIX: &str = "session-";

/// Tunables the lifecycle manager reads.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Meter event for heartbeats that do not name one.
    pub meter_event: String,
    /// Meter event for the closing flush.
    pub final_meter_event: String,
    /// Price reference attached to pre-authorizations.
    pub price_ref: Option<String>,
    /// Attempts allowed for the agent-start job.
    pub job_max_attempts: u32,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            meter_event: config.billing.meter_event.clone(),
            final_meter_event: config.billing.final_meter_event.clone(),
            price_ref: config.billing.price_ref.clone(),
            job_max_attempts: config.jobs.max_attempts,
        }
    }
}

/// Everything the lifecycle manager talks to.
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub rooms: Arc<dyn RoomGateway>,
    pub billing: Arc<dyn BillingGateway>,
    pub dispatcher: JobDispatcher,
    pub usage: UsageEmitter,
}

/// Orchestrates session start, heartbeats and close-out.
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    accounts: Arc<dyn AccountDirectory>,
    rooms: Arc<dyn RoomGateway>,
    billing: Arc<dyn BillingGateway>,
    dispatcher: JobDispatcher,
    usage: UsageEmitter,
    settings: LifecycleSettings,
    rng: SystemRandom,
}

/// Allocate a fresh room identifier, `session-{32 hex chars}`.
///
/// # Errors
///
/// Returns `ScError::Internal` if the system RNG fails.
pub fn allocate_room_id(rng: &SystemRandom) -> Result<String, ScError> {
    let mut bytes = [0u8; ROOM_ID_RANDOM_BYTES];
    rng.fill(&mut bytes).map_err(|_| {
        error!(target: "sc.lifecycle", "System RNG failed while allocating room id");
        ScError::Internal
    })?;
    Ok(format!("{ROOM_ID_PREFIX}{}", hex::encode(bytes)))
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ScError> {
    if value.trim().is_empty() {
        return Err(ScError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

fn validate_minutes(minutes: f64) -> Result<(), ScError> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(ScError::BadRequest(
            "minutes must be a positive number".to_string(),
        ));
    }
    Ok(())
}

/// Map a rejected compare-and-set to the error the caller sees.
fn rejection(current: SessionStatus, wanted: SessionStatus) -> ScError {
    if current.is_terminal() {
        ScError::AlreadyTerminal { status: current }
    } else {
        ScError::InvalidTransition {
            from: current,
            to: wanted,
        }
    }
}

fn session_not_found() -> ScError {
    ScError::NotFound("Session not found".to_string())
}

fn observe<T>(operation: &str, result: &Result<T, ScError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => {
            metrics::record_error(operation, e.kind(), e.status_code());
            e.kind()
        }
    };
    metrics::record_lifecycle_operation(operation, outcome, started.elapsed());
}

impl SessionManager {
    pub fn new(collaborators: Collaborators, settings: LifecycleSettings) -> Self {
        Self {
            sessions: collaborators.sessions,
            accounts: collaborators.accounts,
            rooms: collaborators.rooms,
            billing: collaborators.billing,
            dispatcher: collaborators.dispatcher,
            usage: collaborators.usage,
            settings,
            rng: SystemRandom::new(),
        }
    }

    /// Start a billed session.
    ///
    /// Creates the room, resolves the fan's billing customer, validates the
    /// payment method, persists the session, mints both credentials and
    /// enqueues the agent-start job. Any failure aborts the whole operation
    /// and no credentials are returned.
    ///
    /// # Errors
    ///
    /// - `BadRequest` - missing payment method or email
    /// - `NotFound` - creator absent or owned by another tenant
    /// - `UpstreamUnavailable` - room or billing call failed
    /// - `Database` - the store rejected a write
    #[instrument(skip_all, fields(tenant_id = %request.tenant_id, creator_id = %request.creator_id))]
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<StartSessionResponse, ScError> {
        let started = Instant::now();
        let result = self.start_session_inner(request).await;
        observe("start", &result, started);
        result
    }

    async fn start_session_inner(
        &self,
        request: StartSessionRequest,
    ) -> Result<StartSessionResponse, ScError> {
        require_non_empty(&request.payment_method_id, "payment_method_id")?;
        require_non_empty(&request.customer_email, "customer_email")?;

        let creator = self
            .accounts
            .find_creator(request.creator_id)
            .await?
            .filter(|c| c.tenant_id == request.tenant_id)
            .ok_or_else(|| ScError::NotFound("Creator not found".to_string()))?;

        let session_id = SessionId::new();
        let room_id = allocate_room_id(&self.rng)?;

        // An orphaned room from a later failure is reclaimed by its empty timeout.
        let room_metadata = serde_json::json!({
            "sessionId": session_id.to_string(),
            "tenantId": request.tenant_id.to_string(),
            "creatorId": creator.id.to_string(),
            "fanId": request.fan_id.to_string(),
        });
        self.rooms.ensure_room(&room_id, &room_metadata).await?;

        let customer_ref = self
            .resolve_customer(request.tenant_id, &request)
            .await?;

        self.billing
            .pre_authorize(
                &customer_ref,
                &request.payment_method_id,
                self.settings.price_ref.as_deref(),
            )
            .await?;

        let session = self
            .sessions
            .insert_session(NewSession {
                id: session_id,
                tenant_id: request.tenant_id,
                creator_id: creator.id,
                fan_id: request.fan_id,
                room_id: room_id.clone(),
                billing_customer_ref: customer_ref,
                metadata: request
                    .metadata
                    .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
            })
            .await?;

        match self.issue_credentials_and_job(&session).await {
            Ok(response) => {
                info!(
                    target: "sc.lifecycle",
                    session_id = %session.id,
                    room_id = %session.room_id,
                    "Session started"
                );
                Ok(response)
            }
            Err(e) => {
                self.abandon(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Use the stored billing customer, or create one and remember it.
    async fn resolve_customer(
        &self,
        tenant_id: TenantId,
        request: &StartSessionRequest,
    ) -> Result<String, ScError> {
        if let Some(existing) = self
            .accounts
            .billing_customer_for(tenant_id, request.fan_id)
            .await?
        {
            return Ok(existing);
        }

        let created = self
            .billing
            .ensure_customer(tenant_id, &request.customer_email)
            .await?;
        self.accounts
            .set_billing_customer(tenant_id, request.fan_id, &created)
            .await?;
        Ok(created)
    }

    async fn issue_credentials_and_job(
        &self,
        session: &Session,
    ) -> Result<StartSessionResponse, ScError> {
        let fan_credential = self
            .rooms
            .create_credential(
                &session.room_id,
                &participant_identity(ParticipantRole::Fan, &session.fan_id),
                ParticipantRole::Fan,
                session.id,
            )
            .await?;
        let agent_credential = self
            .rooms
            .create_credential(
                &session.room_id,
                &participant_identity(ParticipantRole::Agent, &session.creator_id),
                ParticipantRole::Agent,
                session.id,
            )
            .await?;

        let payload = serde_json::to_value(AgentStartPayload {
            session_id: session.id,
            room_id: session.room_id.clone(),
            creator_id: session.creator_id,
            agent_credential: agent_credential.clone(),
        })
        .map_err(|e| {
            error!(target: "sc.lifecycle", error = %e, "Failed to encode agent-start payload");
            ScError::Internal
        })?;

        self.dispatcher
            .enqueue(AGENT_START_JOB_KIND, payload, self.settings.job_max_attempts)
            .await?;

        Ok(StartSessionResponse {
            session_id: session.id,
            room_id: session.room_id.clone(),
            fan_credential,
            agent_credential,
        })
    }

    /// Cancel a session whose start failed after the row was written.
    async fn abandon(&self, session: &Session, cause: &ScError) {
        warn!(
            target: "sc.lifecycle",
            session_id = %session.id,
            error = %cause,
            "Session start failed after persistence, cancelling"
        );
        match self
            .sessions
            .transition(
                session.id,
                SessionStatus::sources_of(SessionStatus::Cancelled),
                SessionStatus::Cancelled,
                Some(Utc::now()),
            )
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                metrics::record_session_transition(SessionStatus::Cancelled.as_str());
            }
            Ok(outcome) => {
                warn!(target: "sc.lifecycle", session_id = %session.id, ?outcome, "Abandoned session was not in created state");
            }
            Err(e) => {
                error!(target: "sc.lifecycle", session_id = %session.id, error = %e, "Failed to cancel abandoned session");
            }
        }
    }

    /// Add consumed minutes to a session.
    ///
    /// The increment and the `created -> active` promotion are one atomic
    /// write. One usage event is emitted and not waited on.
    ///
    /// Duplicate deliveries of one heartbeat are counted twice.
    ///
    /// # Errors
    ///
    /// - `BadRequest` - minutes not a positive finite number, or empty meter name
    /// - `NotFound` - no such session
    /// - `AlreadyTerminal` - session is ended or cancelled; nothing changed
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn heartbeat(
        &self,
        session_id: SessionId,
        minutes: f64,
        meter_event: Option<&str>,
    ) -> Result<(), ScError> {
        let started = Instant::now();
        let result = self.heartbeat_inner(session_id, minutes, meter_event).await;
        observe("heartbeat", &result, started);
        result
    }

    async fn heartbeat_inner(
        &self,
        session_id: SessionId,
        minutes: f64,
        meter_event: Option<&str>,
    ) -> Result<(), ScError> {
        validate_minutes(minutes)?;
        let meter_event = meter_event.unwrap_or(&self.settings.meter_event);
        require_non_empty(meter_event, "meter_event")?;

        match self.sessions.add_minutes(session_id, minutes).await? {
            MinutesOutcome::Applied { session, activated } => {
                if activated {
                    metrics::record_session_transition(SessionStatus::Active.as_str());
                    info!(target: "sc.lifecycle", session_id = %session.id, "Session active");
                }
                self.emit_usage(&session, meter_event, minutes, "periodic");
                Ok(())
            }
            MinutesOutcome::NotFound => Err(session_not_found()),
            MinutesOutcome::Terminal(status) => {
                warn!(target: "sc.lifecycle", session_id = %session_id, status = %status, "Heartbeat for terminal session rejected");
                Err(ScError::AlreadyTerminal { status })
            }
        }
    }

    /// Close a session.
    ///
    /// An active session is ended. A session that never became active can
    /// only be cancelled, so that is what happens to it. The room teardown is
    /// best-effort. If any minutes were consumed, one final usage event
    /// carries the whole counter under the final meter name.
    ///
    /// # Errors
    ///
    /// - `NotFound` - no such session
    /// - `AlreadyTerminal` - session already ended or cancelled
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn terminate(&self, session_id: SessionId) -> Result<SessionView, ScError> {
        let started = Instant::now();
        let result = self.terminate_inner(session_id).await;
        observe("terminate", &result, started);
        result
    }

    async fn terminate_inner(&self, session_id: SessionId) -> Result<SessionView, ScError> {
        let mut target = SessionStatus::Ended;
        // Status only moves forward, so this settles within two rounds.
        let session = loop {
            match self.close(session_id, target).await {
                Ok(session) => break session,
                Err(ScError::InvalidTransition {
                    from: SessionStatus::Created,
                    ..
                }) if target == SessionStatus::Ended => target = SessionStatus::Cancelled,
                Err(ScError::InvalidTransition {
                    from: SessionStatus::Active,
                    ..
                }) if target == SessionStatus::Cancelled => target = SessionStatus::Ended,
                Err(e) => return Err(e),
            }
        };

        if session.status == SessionStatus::Cancelled {
            info!(
                target: "sc.lifecycle",
                session_id = %session.id,
                "Session terminated before activation, cancelled"
            );
            return Ok(SessionView::from(&session));
        }

        if session.minutes_consumed > 0.0 {
            self.emit_usage(
                &session,
                &self.settings.final_meter_event,
                session.minutes_consumed,
                "final",
            );
        }

        info!(
            target: "sc.lifecycle",
            session_id = %session.id,
            minutes = session.minutes_consumed,
            "Session ended"
        );
        Ok(SessionView::from(&session))
    }

    /// Cancel a session that never became active.
    ///
    /// # Errors
    ///
    /// - `NotFound` - no such session
    /// - `AlreadyTerminal` - session already ended or cancelled
    /// - `InvalidTransition` - session is active (use terminate)
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn cancel_session(&self, session_id: SessionId) -> Result<SessionView, ScError> {
        let started = Instant::now();
        let result = self
            .close(session_id, SessionStatus::Cancelled)
            .await
            .map(|session| {
                info!(target: "sc.lifecycle", session_id = %session.id, "Session cancelled");
                SessionView::from(&session)
            });
        observe("cancel", &result, started);
        result
    }

    /// Read-only view of a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionView, ScError> {
        self.sessions
            .get_session(session_id)
            .await?
            .map(|session| SessionView::from(&session))
            .ok_or_else(session_not_found)
    }

    /// Mint a fresh join credential for a session's room.
    ///
    /// Used to rejoin after a dropped connection. `identity` defaults to the
    /// session's fan or creator for the role. Nothing is written.
    ///
    /// # Errors
    ///
    /// - `BadRequest` - `identity` given but blank
    /// - `NotFound` - no such session
    /// - `AlreadyTerminal` - session is ended or cancelled
    /// - `UpstreamUnavailable` - the credential could not be minted
    #[instrument(skip_all, fields(session_id = %session_id, role = ?role))]
    pub async fn join_credential(
        &self,
        session_id: SessionId,
        role: ParticipantRole,
        identity: Option<&str>,
    ) -> Result<JoinCredentialResponse, ScError> {
        let started = Instant::now();
        let result = self.join_credential_inner(session_id, role, identity).await;
        observe("join", &result, started);
        result
    }

    async fn join_credential_inner(
        &self,
        session_id: SessionId,
        role: ParticipantRole,
        identity: Option<&str>,
    ) -> Result<JoinCredentialResponse, ScError> {
        if let Some(identity) = identity {
            require_non_empty(identity, "identity")?;
        }

        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(session_not_found)?;
        if session.status.is_terminal() {
            return Err(ScError::AlreadyTerminal {
                status: session.status,
            });
        }

        let identity = match (identity, role) {
            (Some(identity), _) => identity.to_string(),
            (None, ParticipantRole::Fan) => participant_identity(role, &session.fan_id),
            (None, ParticipantRole::Agent) => participant_identity(role, &session.creator_id),
        };
        let credential = self
            .rooms
            .create_credential(&session.room_id, &identity, role, session.id)
            .await?;

        info!(target: "sc.lifecycle", session_id = %session.id, role = ?role, "Join credential issued");
        Ok(JoinCredentialResponse {
            session_id: session.id,
            room_id: session.room_id,
            credential,
        })
    }

    /// Move to a terminal status, then tear down the room.
    async fn close(&self, session_id: SessionId, to: SessionStatus) -> Result<Session, ScError> {
        let outcome = self
            .sessions
            .transition(
                session_id,
                SessionStatus::sources_of(to),
                to,
                Some(Utc::now()),
            )
            .await?;

        let session = match outcome {
            TransitionOutcome::Applied(session) => session,
            TransitionOutcome::NotFound => return Err(session_not_found()),
            TransitionOutcome::Rejected(current) => return Err(rejection(current, to)),
        };
        metrics::record_session_transition(to.as_str());

        if let Err(e) = self.rooms.end_room(&session.room_id).await {
            // The media server reclaims the room once it is empty.
            warn!(
                target: "sc.lifecycle",
                session_id = %session.id,
                room_id = %session.room_id,
                error = %e,
                "Room teardown failed, leaving it to idle timeout"
            );
        }

        Ok(session)
    }

    fn emit_usage(&self, session: &Session, meter_event: &str, quantity: f64, flush: &str) {
        let queued = self.usage.emit(UsageEvent {
            session_id: session.id,
            tenant_id: session.tenant_id,
            customer_ref: session.billing_customer_ref.clone(),
            metric: UsageMetric::Minutes,
            meter_event: meter_event.to_string(),
            quantity,
            recorded_at: Utc::now(),
        });
        if queued {
            metrics::record_usage_emitted(flush, quantity);
        }
    }
}
