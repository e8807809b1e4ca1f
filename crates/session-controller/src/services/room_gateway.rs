//! Media server room service client.
//!
//! The controller creates one room per session, mints join credentials for
//! the fan and the agent, and tears the room down on termination.
//!
//! # Security
//!
//! - Room service calls carry a short-lived admin token, never the API secret
//! - Join credentials are signed locally and scoped to exactly one room
//! - Credentials are never logged
//!
//! # Orphaned rooms
//!
//! Rooms are created with an empty timeout of at least 60 seconds. A session
//! start that fails after the room exists is cleaned up by the media server
//! when that timeout fires; nothing here rolls the room back.

use crate::config::RoomSettings;
use crate::errors::ScError;
use crate::models::ParticipantRole;
use crate::observability::metrics;
use async_trait::async_trait;
use common::jwt::{sign_room_claims, ParticipantMetadata, RoomClaims, VideoGrant};
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionId;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

/// Default timeout for room service requests in seconds.
const ROOM_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Lifetime of the admin token attached to each room service call.
const ADMIN_TOKEN_TTL_SECONDS: i64 = 600;

/// Room service RPC prefix.
const ROOM_SERVICE_PATH: &str = "/twirp/livekit.RoomService";

/// Participant identity for a role, e.g. `fan-{fan_id}` or `agent-{creator_id}`.
pub fn participant_identity(role: ParticipantRole, id: &impl Display) -> String {
    format!("{}-{}", role.as_str(), id)
}

/// Sign a join credential for one participant of one room.
///
/// # Errors
///
/// Returns `ScError::Internal` if the claims cannot be signed.
pub fn mint_join_credential(
    api_key: &str,
    api_secret: &SecretString,
    ttl_seconds: i64,
    room_id: &str,
    identity: &str,
    role: ParticipantRole,
    session_id: SessionId,
) -> Result<String, ScError> {
    let metadata = serde_json::to_string(&ParticipantMetadata {
        role,
        session_id: session_id.to_string(),
    })
    .map_err(|e| {
        error!(target: "sc.services.room", error = %e, "Failed to encode participant metadata");
        ScError::Internal
    })?;

    let now = chrono::Utc::now().timestamp();
    let claims = RoomClaims {
        iss: api_key.to_string(),
        sub: identity.to_string(),
        nbf: now,
        exp: now + ttl_seconds,
        metadata,
        video: VideoGrant::join(room_id),
    };

    sign_room_claims(&claims, api_secret.expose_secret().as_bytes()).map_err(|e| {
        error!(target: "sc.services.room", error = %e, "Failed to sign join credential");
        ScError::Internal
    })
}

/// Operations the lifecycle manager needs from the media server.
#[async_trait]
pub trait RoomGateway: Send + Sync {
    /// Create the room, or refresh its metadata if it already exists.
    async fn ensure_room(&self, room_id: &str, metadata: &serde_json::Value)
        -> Result<(), ScError>;

    /// Mint a signed join credential scoped to `room_id`.
    async fn create_credential(
        &self,
        room_id: &str,
        identity: &str,
        role: ParticipantRole,
        session_id: SessionId,
    ) -> Result<String, ScError>;

    /// Tear the room down. Callers treat failure as best-effort.
    async fn end_room(&self, room_id: &str) -> Result<(), ScError>;
}

#[derive(Debug, Serialize)]
struct CreateRoomRequest<'a> {
    name: &'a str,
    empty_timeout: u32,
    max_participants: u32,
    metadata: String,
}

#[derive(Debug, Serialize)]
struct UpdateRoomMetadataRequest<'a> {
    room: &'a str,
    metadata: String,
}

#[derive(Debug, Serialize)]
struct DeleteRoomRequest<'a> {
    room: &'a str,
}

/// HTTP client for the media server room service.
#[derive(Clone)]
pub struct LiveRoomClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: SecretString,
    credential_ttl_seconds: i64,
    empty_timeout_seconds: u32,
    max_participants: u32,
}

impl LiveRoomClient {
    /// Create a new room service client.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(settings: &RoomSettings) -> Result<Self, ScError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(ROOM_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sc.services.room", error = %e, "Failed to build HTTP client");
                ScError::Internal
            })?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            credential_ttl_seconds: settings.credential_ttl_seconds,
            empty_timeout_seconds: settings.empty_timeout_seconds,
            max_participants: settings.max_participants,
        })
    }

    fn admin_token(&self, room_id: &str) -> Result<String, ScError> {
        let now = chrono::Utc::now().timestamp();
        let claims = RoomClaims {
            iss: self.api_key.clone(),
            sub: "session-controller".to_string(),
            nbf: now,
            exp: now + ADMIN_TOKEN_TTL_SECONDS,
            metadata: String::new(),
            video: VideoGrant::admin(Some(room_id)),
        };

        sign_room_claims(&claims, self.api_secret.expose_secret().as_bytes()).map_err(|e| {
            error!(target: "sc.services.room", error = %e, "Failed to sign admin token");
            ScError::Internal
        })
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        method: &str,
        room_id: &str,
        body: &T,
    ) -> Result<reqwest::Response, ScError> {
        let url = format!("{}{}/{}", self.base_url, ROOM_SERVICE_PATH, method);
        let token = self.admin_token(room_id)?;

        self.client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "sc.services.room", error = %e, method, "Room service request failed");
                ScError::UpstreamUnavailable("Room service is unavailable".to_string())
            })
    }

    async fn update_metadata(&self, room_id: &str, metadata: String) -> Result<(), ScError> {
        let response = self
            .call(
                "UpdateRoomMetadata",
                room_id,
                &UpdateRoomMetadataRequest {
                    room: room_id,
                    metadata,
                },
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::error_for_status(status, "UpdateRoomMetadata"))
    }

    fn error_for_status(status: StatusCode, method: &str) -> ScError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(target: "sc.services.room", status = %status, method, "Room service rejected API credentials");
            return ScError::Internal;
        }
        warn!(target: "sc.services.room", status = %status, method, "Room service returned error");
        ScError::UpstreamUnavailable("Room service is unavailable".to_string())
    }

    async fn ensure_room_inner(
        &self,
        room_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), ScError> {
        let metadata = metadata.to_string();
        let response = self
            .call(
                "CreateRoom",
                room_id,
                &CreateRoomRequest {
                    name: room_id,
                    empty_timeout: self.empty_timeout_seconds,
                    max_participants: self.max_participants,
                    metadata: metadata.clone(),
                },
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT || body.to_ascii_lowercase().contains("already exists") {
            tracing::debug!(target: "sc.services.room", room_id, "Room already exists, refreshing metadata");
            return self.update_metadata(room_id, metadata).await;
        }

        Err(Self::error_for_status(status, "CreateRoom"))
    }

    async fn end_room_inner(&self, room_id: &str) -> Result<(), ScError> {
        let response = self
            .call("DeleteRoom", room_id, &DeleteRoomRequest { room: room_id })
            .await?;

        let status = response.status();
        // Already gone counts as torn down.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::error_for_status(status, "DeleteRoom"))
    }
}

fn call_status<T>(result: &Result<T, ScError>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

#[async_trait]
impl RoomGateway for LiveRoomClient {
    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn ensure_room(
        &self,
        room_id: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), ScError> {
        let start = Instant::now();
        let result = self.ensure_room_inner(room_id, metadata).await;
        metrics::record_gateway_call("room", "ensure_room", call_status(&result), start.elapsed());
        result
    }

    async fn create_credential(
        &self,
        room_id: &str,
        identity: &str,
        role: ParticipantRole,
        session_id: SessionId,
    ) -> Result<String, ScError> {
        mint_join_credential(
            &self.api_key,
            &self.api_secret,
            self.credential_ttl_seconds,
            room_id,
            identity,
            role,
            session_id,
        )
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn end_room(&self, room_id: &str) -> Result<(), ScError> {
        let start = Instant::now();
        let result = self.end_room_inner(room_id).await;
        metrics::record_gateway_call("room", "end_room", call_status(&result), start.elapsed());
        result
    }
}

/// Mock room gateway module for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// API key the mock signs credentials with.
    pub const MOCK_API_KEY: &str = "mock-room-key";

    /// API secret the mock signs credentials with.
    pub const MOCK_API_SECRET: &str = "mock-room-secret-with-enough-length";

    /// A credential the mock handed out.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct IssuedCredential {
        pub room_id: String,
        pub identity: String,
        pub role: ParticipantRole,
        pub session_id: SessionId,
    }

    /// Mock room gateway for unit testing.
    ///
    /// Credentials are real JWTs signed with [`MOCK_API_SECRET`], so tests can
    /// verify their room scope and metadata.
    #[derive(Default)]
    pub struct MockRoomGateway {
        ensured: Mutex<Vec<(String, serde_json::Value)>>,
        ended: Mutex<Vec<String>>,
        issued: Mutex<Vec<IssuedCredential>>,
        fail_ensure: AtomicBool,
        fail_end: AtomicBool,
    }

    impl MockRoomGateway {
        /// Create a mock where every call succeeds.
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a mock whose `ensure_room` always fails.
        pub fn failing_ensure() -> Self {
            let mock = Self::default();
            mock.fail_ensure.store(true, Ordering::SeqCst);
            mock
        }

        /// Create a mock whose `end_room` always fails.
        pub fn failing_end() -> Self {
            let mock = Self::default();
            mock.fail_end.store(true, Ordering::SeqCst);
            mock
        }

        /// Rooms passed to `ensure_room`, in call order.
        pub async fn ensured_rooms(&self) -> Vec<(String, serde_json::Value)> {
            self.ensured.lock().await.clone()
        }

        /// Rooms passed to `end_room`, in call order (including failed calls).
        pub async fn ended_rooms(&self) -> Vec<String> {
            self.ended.lock().await.clone()
        }

        /// Credentials minted so far.
        pub async fn issued_credentials(&self) -> Vec<IssuedCredential> {
            self.issued.lock().await.clone()
        }
    }

    #[async_trait]
    impl RoomGateway for MockRoomGateway {
        async fn ensure_room(
            &self,
            room_id: &str,
            metadata: &serde_json::Value,
        ) -> Result<(), ScError> {
            if self.fail_ensure.load(Ordering::SeqCst) {
                return Err(ScError::UpstreamUnavailable(
                    "Mock room service error".to_string(),
                ));
            }
            self.ensured
                .lock()
                .await
                .push((room_id.to_string(), metadata.clone()));
            Ok(())
        }

        async fn create_credential(
            &self,
            room_id: &str,
            identity: &str,
            role: ParticipantRole,
            session_id: SessionId,
        ) -> Result<String, ScError> {
            let token = mint_join_credential(
                MOCK_API_KEY,
                &SecretString::from(MOCK_API_SECRET),
                600,
                room_id,
                identity,
                role,
                session_id,
            )?;
            self.issued.lock().await.push(IssuedCredential {
                room_id: room_id.to_string(),
                identity: identity.to_string(),
                role,
                session_id,
            });
            Ok(token)
        }

        async fn end_room(&self, room_id: &str) -> Result<(), ScError> {
            self.ended.lock().await.push(room_id.to_string());
            if self.fail_end.load(Ordering::SeqCst) {
                return Err(ScError::UpstreamUnavailable(
                    "Mock room service error".to_string(),
                ));
            }
            Ok(())
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::expect_used)]
    mod tests {
        use super::*;
        use common::jwt::verify_room_credential;

        #[tokio::test]
        async fn test_mock_records_calls() {
            let mock = MockRoomGateway::new();
            let session_id = SessionId::new();

            mock.ensure_room("session-1", &serde_json::json!({"k": "v"}))
                .await
                .unwrap();
            let token = mock
                .create_credential("session-1", "fan-1", ParticipantRole::Fan, session_id)
                .await
                .unwrap();
            mock.end_room("session-1").await.unwrap();

            assert_eq!(mock.ensured_rooms().await.len(), 1);
            assert_eq!(mock.ended_rooms().await, vec!["session-1".to_string()]);

            let claims =
                verify_room_credential(&token, MOCK_API_SECRET.as_bytes(), MOCK_API_KEY).unwrap();
            assert_eq!(claims.video.room.as_deref(), Some("session-1"));
        }

        #[tokio::test]
        async fn test_mock_failing_ensure() {
            let mock = MockRoomGateway::failing_ensure();
            let result = mock.ensure_room("session-1", &serde_json::json!({})).await;

            assert!(matches!(result, Err(ScError::UpstreamUnavailable(_))));
            assert!(mock.ensured_rooms().await.is_empty());
        }

        #[tokio::test]
        async fn test_mock_failing_end_still_records() {
            let mock = MockRoomGateway::failing_end();
            let result = mock.end_room("session-1").await;

            assert!(result.is_err());
            assert_eq!(mock.ended_rooms().await.len(), 1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::jwt::verify_room_credential;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "room-secret-for-client-tests-0000";

    fn settings(url: &str) -> RoomSettings {
        RoomSettings {
            url: url.to_string(),
            api_key: "APIroomkey".to_string(),
            api_secret: SecretString::from(SECRET),
            credential_ttl_seconds: 900,
            empty_timeout_seconds: 60,
            max_participants: 100,
        }
    }

    #[test]
    fn test_participant_identity() {
        assert_eq!(participant_identity(ParticipantRole::Fan, &"42"), "fan-42");
        assert_eq!(participant_identity(ParticipantRole::Agent, &"7"), "agent-7");
    }

    #[tokio::test]
    async fn test_ensure_room_creates_with_policy() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/CreateRoom"))
            .and(header_exists("authorization"))
            .and(body_partial_json(serde_json::json!({
                "name": "session-abc",
                "empty_timeout": 60,
                "max_participants": 100
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "session-abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        client
            .ensure_room("session-abc", &serde_json::json!({"tenantId": "t"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_room_already_exists_updates_metadata() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/CreateRoom"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "code": "already_exists",
                "msg": "room already exists"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/UpdateRoomMetadata"))
            .and(body_partial_json(serde_json::json!({"room": "session-abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        let result = client
            .ensure_room("session-abc", &serde_json::json!({"tenantId": "t"}))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_room_already_exists_in_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/CreateRoom"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Room Already Exists"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/UpdateRoomMetadata"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        assert!(client
            .ensure_room("session-abc", &serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ensure_room_server_error_is_unavailable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        let result = client
            .ensure_room("session-abc", &serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(ScError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_ensure_room_rejected_credentials_is_internal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        let result = client
            .ensure_room("session-abc", &serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(ScError::Internal)));
    }

    #[tokio::test]
    async fn test_ensure_room_unreachable() {
        // Nothing listens on port 1.
        let client = LiveRoomClient::new(&settings("http://127.0.0.1:1")).unwrap();
        let result = client
            .ensure_room("session-abc", &serde_json::json!({}))
            .await;

        assert!(matches!(result, Err(ScError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_end_room_missing_room_is_ok() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/DeleteRoom"))
            .and(body_partial_json(serde_json::json!({"room": "session-abc"})))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        assert!(client.end_room("session-abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_end_room_server_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/twirp/livekit.RoomService/DeleteRoom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = LiveRoomClient::new(&settings(&server.uri())).unwrap();
        assert!(client.end_room("session-abc").await.is_err());
    }

    #[tokio::test]
    async fn test_create_credential_is_room_scoped() {
        let client = LiveRoomClient::new(&settings("http://localhost:7880")).unwrap();
        let session_id = SessionId::new();

        let token = client
            .create_credential("session-abc", "agent-9", ParticipantRole::Agent, session_id)
            .await
            .unwrap();

        let claims = verify_room_credential(&token, SECRET.as_bytes(), "APIroomkey").unwrap();
        assert_eq!(claims.sub, "agent-9");
        assert_eq!(claims.video.room.as_deref(), Some("session-abc"));
        assert!(claims.video.room_join);
        assert!(!claims.video.room_admin);
        assert_eq!(claims.exp - claims.nbf, 900);

        let meta = claims.participant_metadata().unwrap();
        assert_eq!(meta.role, ParticipantRole::Agent);
        assert_eq!(meta.session_id, session_id.to_string());
    }
}
