//! Room join credentials shared by the session controller and agent workers.
//!
//! Credentials are HS256 JWTs signed with the media server API secret. The
//! issuer is the API key, the subject is the participant identity, and the
//! `video` grant scopes the bearer to exactly one room. Participant metadata
//! (role and session id) travels as a JSON string in the `metadata` claim,
//! which is what the media server hands to other participants.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted on verification
//! - The `sub` field is redacted in Debug output

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed credential size in bytes (8KB).
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default credential lifetime (1 hour).
pub const DEFAULT_CREDENTIAL_TTL_SECONDS: i64 = 3600;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while signing or verifying a credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Token size exceeds maximum allowed.
    #[error("The credential is invalid or expired")]
    TokenTooLarge,

    /// Signature, format, expiry or issuer check failed.
    #[error("The credential is invalid or expired")]
    Invalid,

    /// Signing failed (bad key material or unserializable claims).
    #[error("Failed to sign credential: {0}")]
    Signing(String),
}

// =============================================================================
// Claims Types
// =============================================================================

/// Role a participant plays inside a session room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// The paying fan.
    Fan,
    /// The creator's AI avatar agent.
    Agent,
}

impl ParticipantRole {
    /// Returns the string representation used in identities and metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Fan => "fan",
            ParticipantRole::Agent => "agent",
        }
    }
}

/// Participant metadata embedded in a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMetadata {
    /// Role of the participant.
    pub role: ParticipantRole,
    /// Session the credential belongs to.
    pub session_id: String,
}

/// Permissions granted by a credential.
///
/// Join credentials set `room` and `room_join`; admin tokens used to call the
/// room service API set `room_create` / `room_admin` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoGrant {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub room_join: bool,
    pub room_create: bool,
    pub room_admin: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
}

impl VideoGrant {
    /// Grant to join a single room with full publish/subscribe rights.
    #[must_use]
    pub fn join(room: &str) -> Self {
        Self {
            room: Some(room.to_string()),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
            ..Self::default()
        }
    }

    /// Grant to create and administer rooms through the room service API.
    #[must_use]
    pub fn admin(room: Option<&str>) -> Self {
        Self {
            room: room.map(str::to_string),
            room_create: true,
            room_admin: true,
            ..Self::default()
        }
    }
}

/// Claims carried by a room credential.
#[derive(Clone, Serialize, Deserialize)]
pub struct RoomClaims {
    /// Issuer: the media server API key.
    pub iss: String,
    /// Subject: participant identity (e.g. `fan-{id}`). Redacted in Debug.
    pub sub: String,
    /// Not-before (Unix epoch seconds).
    pub nbf: i64,
    /// Expiration (Unix epoch seconds).
    pub exp: i64,
    /// JSON-encoded participant metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    /// Room permissions.
    pub video: VideoGrant,
}

impl fmt::Debug for RoomClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomClaims")
            .field("iss", &self.iss)
            .field("sub", &"[REDACTED]")
            .field("nbf", &self.nbf)
            .field("exp", &self.exp)
            .field("metadata", &self.metadata)
            .field("video", &self.video)
            .finish()
    }
}

impl RoomClaims {
    /// Parse the embedded participant metadata, if any.
    #[must_use]
    pub fn participant_metadata(&self) -> Option<ParticipantMetadata> {
        if self.metadata.is_empty() {
            return None;
        }
        serde_json::from_str(&self.metadata).ok()
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Sign claims with the API secret (HS256).
///
/// # Errors
///
/// Returns `CredentialError::Signing` if encoding fails.
pub fn sign_room_claims(claims: &RoomClaims, secret: &[u8]) -> Result<String, CredentialError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| CredentialError::Signing(e.to_string()))
}

/// Verify a credential and return its claims.
///
/// Checks size, signature, expiry and that the issuer matches `api_key`.
///
/// # Errors
///
/// - `TokenTooLarge` - token exceeds `MAX_JWT_SIZE_BYTES`
/// - `Invalid` - anything else wrong with the token
pub fn verify_room_credential(
    token: &str,
    secret: &[u8],
    api_key: &str,
) -> Result<RoomClaims, CredentialError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(CredentialError::TokenTooLarge);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[api_key]);
    validation.validate_nbf = true;
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);

    decode::<RoomClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|_| CredentialError::Invalid)
}
