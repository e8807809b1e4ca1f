//! Session Controller configuration.
//!
//! Configuration is loaded from environment variables. Secrets are held as
//! `SecretString` and every sensitive field is redacted in Debug output.

use common::config::{DatabaseConfig, LogFormat, ObservabilityConfig};
use common::jwt::DEFAULT_CREDENTIAL_TTL_SECONDS;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default media server room service URL.
pub const DEFAULT_ROOM_GATEWAY_URL: &str = "http://localhost:7880";

/// Default billing processor API base URL.
pub const DEFAULT_BILLING_API_URL: &str = "https://api.stripe.com";

/// Default agent orchestrator URL.
pub const DEFAULT_AGENT_LAUNCHER_URL: &str = "http://localhost:8090";

/// Meter event emitted for periodic heartbeats.
pub const DEFAULT_METER_EVENT: &str = "live_minutes";

/// Meter event emitted for the closing flush on terminate.
pub const DEFAULT_FINAL_METER_EVENT: &str = "live_minutes_final";

/// Minimum idle timeout the media server must apply to an empty room.
pub const MIN_ROOM_EMPTY_TIMEOUT_SECONDS: u32 = 60;

/// Default participant cap per room.
pub const DEFAULT_ROOM_MAX_PARTICIPANTS: u32 = 100;

/// Default delivery attempts for a dispatched job.
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;

/// Default number of job worker loops.
pub const DEFAULT_JOB_WORKERS: usize = 2;

/// Default delay between queue polls when idle.
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default base delay for retry backoff.
pub const DEFAULT_JOB_RETRY_BACKOFF_MS: u64 = 1000;

/// Default lease held by a worker on a claimed job.
pub const DEFAULT_JOB_LEASE_SECONDS: u64 = 60;

/// Default number of reconciliation shards.
pub const DEFAULT_RECONCILER_SHARDS: usize = 4;

/// Default graceful shutdown drain period.
pub const DEFAULT_DRAIN_SECONDS: u64 = 30;

/// Default database pool size.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;

/// Default per-statement timeout.
pub const DEFAULT_DB_STATEMENT_TIMEOUT_SECONDS: u32 = 5;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "session_controller=info,common=info,tower_http=info";

/// Media server connection and room policy.
#[derive(Clone)]
pub struct RoomSettings {
    /// Room service base URL.
    pub url: String,
    /// API key (credential issuer).
    pub api_key: String,
    /// API secret used to sign credentials.
    pub api_secret: SecretString,
    /// Lifetime of issued join credentials.
    pub credential_ttl_seconds: i64,
    /// Seconds an empty room survives before the media server reclaims it.
    pub empty_timeout_seconds: u32,
    /// Maximum participants per room.
    pub max_participants: u32,
}

/// Billing processor connection details.
#[derive(Clone)]
pub struct BillingSettings {
    /// API base URL.
    pub api_url: String,
    /// Secret API key.
    pub secret_key: SecretString,
    /// Per-minute price reference attached to pre-authorizations.
    pub price_ref: Option<String>,
    /// Meter event for heartbeats.
    pub meter_event: String,
    /// Meter event for the closing flush.
    pub final_meter_event: String,
}

/// Job dispatcher tuning.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_attempts: u32,
    pub workers: usize,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub lease: Duration,
}

/// Session Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Server bind address.
    pub bind_address: String,

    /// Relational store connection.
    pub database: DatabaseConfig,

    /// Media server settings.
    pub room: RoomSettings,

    /// Billing processor settings.
    pub billing: BillingSettings,

    /// Agent orchestrator URL.
    pub agent_launcher_url: String,

    /// Job dispatcher settings.
    pub jobs: JobSettings,

    /// Number of ordered reconciliation paths.
    pub reconciler_shards: usize,

    /// Logging settings.
    pub observability: ObservabilityConfig,

    /// Seconds to keep serving after a shutdown signal.
    pub drain_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[REDACTED]")
            .field("db_max_connections", &self.database.max_connections)
            .field("room_gateway_url", &self.room.url)
            .field("room_api_key", &self.room.api_key)
            .field("room_api_secret", &"[REDACTED]")
            .field("credential_ttl_seconds", &self.room.credential_ttl_seconds)
            .field("room_empty_timeout_seconds", &self.room.empty_timeout_seconds)
            .field("room_max_participants", &self.room.max_participants)
            .field("billing_api_url", &self.billing.api_url)
            .field("billing_secret_key", &"[REDACTED]")
            .field("billing_price_ref", &self.billing.price_ref)
            .field("meter_event", &self.billing.meter_event)
            .field("final_meter_event", &self.billing.final_meter_event)
            .field("agent_launcher_url", &self.agent_launcher_url)
            .field("jobs", &self.jobs)
            .field("reconciler_shards", &self.reconciler_shards)
            .field("log_format", &self.observability.log_format)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid credential configuration: {0}")]
    InvalidCredentialTtl(String),

    #[error("Invalid room configuration: {0}")]
    InvalidRoomSettings(String),

    #[error("Invalid job configuration: {0}")]
    InvalidJobSettings(String),

    #[error("Invalid reconciler configuration: {0}")]
    InvalidReconcilerShards(String),

    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseSettings(String),

    #[error("Invalid observability configuration: {0}")]
    InvalidObservability(String),

    #[error("Invalid meter event configuration: {0}")]
    InvalidMeterEvent(String),
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// Parse an optional numeric variable. The error is a message naming the
/// variable; callers wrap it in the variant for their concern.
fn parse_number<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(None),
        Some(value_str) => value_str.parse::<T>().map(Some).map_err(|e| {
            format!(
                "{} must be a valid positive integer, got '{}': {}",
                name, value_str, e
            )
        }),
    }
}

/// Parse a numeric variable that must be greater than zero.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, String>
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: fmt::Display,
{
    let value = parse_number(vars, name)?.unwrap_or(default);
    if value <= T::default() {
        return Err(format!("{} must be greater than 0", name));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = required(vars, "DATABASE_URL")?;
        let room_api_key = required(vars, "ROOM_API_KEY")?;
        let room_api_secret = required(vars, "ROOM_API_SECRET")?;
        let billing_secret_key = required(vars, "BILLING_SECRET_KEY")?;

        let bind_address = optional(vars, "BIND_ADDRESS", DEFAULT_BIND_ADDRESS);

        let max_connections =
            parse_positive(vars, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)
                .map_err(ConfigError::InvalidDatabaseSettings)?;
        let statement_timeout_secs = parse_positive(
            vars,
            "DB_STATEMENT_TIMEOUT_SECONDS",
            DEFAULT_DB_STATEMENT_TIMEOUT_SECONDS,
        )
        .map_err(ConfigError::InvalidDatabaseSettings)?;

        // Credential lifetime
        let credential_ttl_seconds = parse_positive(
            vars,
            "CREDENTIAL_TTL_SECONDS",
            DEFAULT_CREDENTIAL_TTL_SECONDS,
        )
        .map_err(ConfigError::InvalidCredentialTtl)?;

        // Room policy. The idle timeout is the only reclaim path for rooms
        // orphaned by a failed start, so it has a floor.
        let empty_timeout_seconds = parse_number::<u32>(vars, "ROOM_EMPTY_TIMEOUT_SECONDS")
            .map_err(ConfigError::InvalidRoomSettings)?
            .unwrap_or(MIN_ROOM_EMPTY_TIMEOUT_SECONDS);
        if empty_timeout_seconds < MIN_ROOM_EMPTY_TIMEOUT_SECONDS {
            return Err(ConfigError::InvalidRoomSettings(format!(
                "ROOM_EMPTY_TIMEOUT_SECONDS must be at least {}, got {}",
                MIN_ROOM_EMPTY_TIMEOUT_SECONDS, empty_timeout_seconds
            )));
        }

        let max_participants = parse_positive(
            vars,
            "ROOM_MAX_PARTICIPANTS",
            DEFAULT_ROOM_MAX_PARTICIPANTS,
        )
        .map_err(ConfigError::InvalidRoomSettings)?;
        if max_participants < 2 {
            return Err(ConfigError::InvalidRoomSettings(format!(
                "ROOM_MAX_PARTICIPANTS must allow the fan and the agent, got {}",
                max_participants
            )));
        }

        // Meter events
        let meter_event = optional(vars, "SESSION_METER_EVENT", DEFAULT_METER_EVENT);
        let final_meter_event =
            optional(vars, "SESSION_FINAL_METER_EVENT", DEFAULT_FINAL_METER_EVENT);
        if meter_event == final_meter_event {
            return Err(ConfigError::InvalidMeterEvent(format!(
                "SESSION_FINAL_METER_EVENT must differ from SESSION_METER_EVENT ('{}')",
                meter_event
            )));
        }

        let price_ref = vars
            .get("BILLING_PRICE_PER_MINUTE")
            .filter(|v| !v.is_empty())
            .cloned();

        // Job dispatcher
        let max_attempts = parse_positive(vars, "JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS)
            .map_err(ConfigError::InvalidJobSettings)?;
        let workers = parse_positive(vars, "JOB_WORKERS", DEFAULT_JOB_WORKERS)
            .map_err(ConfigError::InvalidJobSettings)?;
        let poll_interval_ms =
            parse_positive(vars, "JOB_POLL_INTERVAL_MS", DEFAULT_JOB_POLL_INTERVAL_MS)
                .map_err(ConfigError::InvalidJobSettings)?;
        let retry_backoff_ms = parse_number::<u64>(vars, "JOB_RETRY_BACKOFF_MS")
            .map_err(ConfigError::InvalidJobSettings)?
            .unwrap_or(DEFAULT_JOB_RETRY_BACKOFF_MS);
        let lease_seconds = parse_positive(vars, "JOB_LEASE_SECONDS", DEFAULT_JOB_LEASE_SECONDS)
            .map_err(ConfigError::InvalidJobSettings)?;

        let reconciler_shards =
            parse_positive(vars, "RECONCILER_SHARDS", DEFAULT_RECONCILER_SHARDS)
                .map_err(ConfigError::InvalidReconcilerShards)?;

        // Logging
        let log_format = match vars.get("LOG_FORMAT") {
            Some(value) => value
                .parse::<LogFormat>()
                .map_err(ConfigError::InvalidObservability)?,
            None => LogFormat::default(),
        };
        let log_level = optional(vars, "LOG_LEVEL", DEFAULT_LOG_LEVEL);

        let drain_seconds = parse_number::<u64>(vars, "SC_DRAIN_SECONDS")
            .map_err(ConfigError::InvalidObservability)?
            .unwrap_or(DEFAULT_DRAIN_SECONDS);

        Ok(Config {
            bind_address,
            database: DatabaseConfig {
                postgres_url: SecretString::from(database_url),
                max_connections,
                statement_timeout_secs,
            },
            room: RoomSettings {
                url: optional(vars, "ROOM_GATEWAY_URL", DEFAULT_ROOM_GATEWAY_URL),
                api_key: room_api_key,
                api_secret: SecretString::from(room_api_secret),
                credential_ttl_seconds,
                empty_timeout_seconds,
                max_participants,
            },
            billing: BillingSettings {
                api_url: optional(vars, "BILLING_API_URL", DEFAULT_BILLING_API_URL),
                secret_key: SecretString::from(billing_secret_key),
                price_ref,
                meter_event,
                final_meter_event,
            },
            agent_launcher_url: optional(vars, "AGENT_LAUNCHER_URL", DEFAULT_AGENT_LAUNCHER_URL),
            jobs: JobSettings {
                max_attempts,
                workers,
                poll_interval: Duration::from_millis(poll_interval_ms),
                retry_backoff: Duration::from_millis(retry_backoff_ms),
                lease: Duration::from_secs(lease_seconds),
            },
            reconciler_shards,
            observability: ObservabilityConfig {
                log_level,
                log_format,
            },
            drain_seconds,
        })
    }
}
