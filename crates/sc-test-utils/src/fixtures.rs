//! Seed data and request builders.

use common::types::{CreatorId, FanId, TenantId};
use session_controller::config::Config;
use session_controller::models::{Creator, StartSessionRequest};
use session_controller::store::memory::MemoryStore;
use std::collections::HashMap;

/// Payment method the billing mock accepts.
pub const TEST_PAYMENT_METHOD: &str = "pm_card_visa";

/// Email used for every seeded fan.
pub const TEST_CUSTOMER_EMAIL: &str = "fan@example.com";

/// Environment a test `Config` is built from.
pub fn test_config_vars() -> HashMap<String, String> {
    HashMap::from([
        (
            "DATABASE_URL".to_string(),
            "postgresql://test/test".to_string(),
        ),
        ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("ROOM_API_KEY".to_string(), "test-room-key".to_string()),
        (
            "ROOM_API_SECRET".to_string(),
            "test-room-secret-with-enough-length".to_string(),
        ),
        ("BILLING_SECRET_KEY".to_string(), "sk_test_sc".to_string()),
        ("JOB_RETRY_BACKOFF_MS".to_string(), "0".to_string()),
        ("SC_DRAIN_SECONDS".to_string(), "0".to_string()),
    ])
}

/// A `Config` suitable for tests.
///
/// # Panics
///
/// Panics if the fixed test environment stops parsing.
pub fn test_config() -> Config {
    Config::from_vars(&test_config_vars()).expect("test config should parse")
}

/// One tenant, one of its creators and one fan.
#[derive(Debug, Clone)]
pub struct Seed {
    pub tenant_id: TenantId,
    pub creator_id: CreatorId,
    pub fan_id: FanId,
}

impl Seed {
    /// Fresh identifiers. Nothing is stored yet.
    pub fn new() -> Self {
        Self {
            tenant_id: TenantId::new(),
            creator_id: CreatorId::new(),
            fan_id: FanId::new(),
        }
    }

    /// The seeded creator row.
    pub fn creator(&self) -> Creator {
        Creator {
            id: self.creator_id,
            tenant_id: self.tenant_id,
            display_name: "Test Persona".to_string(),
        }
    }

    /// Store the creator so session starts can find it.
    pub async fn insert_into(&self, store: &MemoryStore) {
        store.insert_creator(self.creator()).await;
    }

    /// A valid start request for this fan and creator.
    pub fn start_request(&self) -> StartSessionRequest {
        StartSessionRequest {
            tenant_id: self.tenant_id,
            creator_id: self.creator_id,
            fan_id: self.fan_id,
            payment_method_id: TEST_PAYMENT_METHOD.to_string(),
            customer_email: TEST_CUSTOMER_EMAIL.to_string(),
            metadata: Some(serde_json::json!({ "topic": "fixture" })),
        }
    }

    /// The same request as a JSON body for `POST /v1/sessions`.
    pub fn start_body(&self) -> serde_json::Value {
        serde_json::json!({
            "tenant_id": self.tenant_id,
            "creator_id": self.creator_id,
            "fan_id": self.fan_id,
            "payment_method_id": TEST_PAYMENT_METHOD,
            "customer_email": TEST_CUSTOMER_EMAIL,
            "metadata": { "topic": "fixture" },
        })
    }
}

impl Default for Seed {
    fn default() -> Self {
        Self::new()
    }
}
