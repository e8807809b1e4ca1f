//! Payment processor client.
//!
//! Covers the three calls the session core makes: resolving a fan's customer
//! record, a zero-amount pre-authorization that validates the payment method
//! without capturing funds, and metered usage submission.
//!
//! # Security
//!
//! - The secret key is sent as a bearer token and never logged
//! - Customer references are logged at debug level only
//! - Usage submissions carry an idempotency key equal to the ledger record id,
//!   so a re-forwarded record is not billed twice

use crate::config::BillingSettings;
use crate::errors::ScError;
use crate::observability::metrics;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::TenantId;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Default timeout for billing requests in seconds.
const BILLING_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Currency of the zero-amount pre-authorization.
const PRE_AUTHORIZATION_CURRENCY: &str = "usd";

/// Operations the session core needs from the payment processor.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Find the tenant-scoped customer for `email`, creating one if missing.
    async fn ensure_customer(&self, tenant_id: TenantId, email: &str) -> Result<String, ScError>;

    /// Validate the payment method with a zero-amount authorization.
    ///
    /// Returns the processor's authorization reference.
    async fn pre_authorize(
        &self,
        customer_ref: &str,
        payment_method_id: &str,
        price_ref: Option<&str>,
    ) -> Result<String, ScError>;

    /// Submit metered usage. `idempotency_key` deduplicates resubmissions.
    async fn record_usage(
        &self,
        meter_event: &str,
        quantity: f64,
        customer_ref: &str,
        idempotency_key: &str,
    ) -> Result<(), ScError>;
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    data: Vec<ObjectRef>,
}

/// HTTP client for the payment processor API.
#[derive(Clone)]
pub struct StripeBillingClient {
    client: Client,
    api_url: String,
    secret_key: SecretString,
}

impl StripeBillingClient {
    /// Create a new billing client.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(settings: &BillingSettings) -> Result<Self, ScError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(BILLING_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sc.services.billing", error = %e, "Failed to build HTTP client");
                ScError::Internal
            })?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            secret_key: settings.secret_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_url, path)
    }

    fn unavailable(e: &reqwest::Error) -> ScError {
        warn!(target: "sc.services.billing", error = %e, "Billing request failed");
        ScError::UpstreamUnavailable("Billing service is unavailable".to_string())
    }

    /// Map a non-success response to an error.
    async fn error_for_response(response: reqwest::Response, operation: &str) -> ScError {
        let status = response.status();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(target: "sc.services.billing", status = %status, operation, "Billing service returned server error");
            ScError::UpstreamUnavailable("Billing service is unavailable".to_string())
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(target: "sc.services.billing", status = %status, operation, "Billing secret key rejected");
            ScError::Internal
        } else if status == StatusCode::BAD_REQUEST || status == StatusCode::PAYMENT_REQUIRED {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "sc.services.billing", status = %status, operation, body = %body, "Billing request rejected");
            ScError::BadRequest("Billing request was rejected".to_string())
        } else {
            warn!(target: "sc.services.billing", status = %status, operation, "Unexpected billing response");
            ScError::UpstreamUnavailable("Billing service is unavailable".to_string())
        }
    }

    async fn parse_ref(response: reqwest::Response, operation: &str) -> Result<String, ScError> {
        if !response.status().is_success() {
            return Err(Self::error_for_response(response, operation).await);
        }
        response
            .json::<ObjectRef>()
            .await
            .map(|object| object.id)
            .map_err(|e| {
                error!(target: "sc.services.billing", error = %e, operation, "Failed to parse billing response");
                ScError::Internal
            })
    }

    async fn find_customer(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<Option<String>, ScError> {
        let query = format!(
            "metadata['tenantId']:'{}' AND email:'{}'",
            tenant_id,
            escape_search_value(email)
        );

        let response = self
            .client
            .get(self.url("customers/search"))
            .bearer_auth(self.secret_key.expose_secret())
            .query(&[("query", query.as_str()), ("limit", "1")])
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;

        if !response.status().is_success() {
            return Err(Self::error_for_response(response, "ensure_customer").await);
        }

        let result: SearchResult = response.json().await.map_err(|e| {
            error!(target: "sc.services.billing", error = %e, "Failed to parse customer search");
            ScError::Internal
        })?;

        Ok(result.data.into_iter().next().map(|c| c.id))
    }

    async fn create_customer(&self, tenant_id: TenantId, email: &str) -> Result<String, ScError> {
        let tenant = tenant_id.to_string();
        let response = self
            .client
            .post(self.url("customers"))
            .bearer_auth(self.secret_key.expose_secret())
            .form(&[("email", email), ("metadata[tenantId]", tenant.as_str())])
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;

        Self::parse_ref(response, "ensure_customer").await
    }

    async fn ensure_customer_inner(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<String, ScError> {
        if let Some(existing) = self.find_customer(tenant_id, email).await? {
            debug!(target: "sc.services.billing", customer_ref = %existing, "Found billing customer");
            return Ok(existing);
        }
        let created = self.create_customer(tenant_id, email).await?;
        debug!(target: "sc.services.billing", customer_ref = %created, "Created billing customer");
        Ok(created)
    }

    async fn pre_authorize_inner(
        &self,
        customer_ref: &str,
        payment_method_id: &str,
        price_ref: Option<&str>,
    ) -> Result<String, ScError> {
        let mut form = vec![
            ("amount", "0"),
            ("currency", PRE_AUTHORIZATION_CURRENCY),
            ("customer", customer_ref),
            ("payment_method", payment_method_id),
            ("payment_method_types[]", "card"),
            ("capture_method", "manual"),
        ];
        if let Some(price) = price_ref {
            form.push(("metadata[priceId]", price));
        }

        let response = self
            .client
            .post(self.url("payment_intents"))
            .bearer_auth(self.secret_key.expose_secret())
            .form(&form)
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;

        Self::parse_ref(response, "pre_authorize").await
    }

    async fn record_usage_inner(
        &self,
        meter_event: &str,
        quantity: f64,
        customer_ref: &str,
        idempotency_key: &str,
    ) -> Result<(), ScError> {
        let value = quantity.to_string();
        let response = self
            .client
            .post(self.url("billing/meter_events"))
            .bearer_auth(self.secret_key.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .form(&[
                ("event_name", meter_event),
                ("payload[stripe_customer_id]", customer_ref),
                ("payload[value]", value.as_str()),
                ("identifier", idempotency_key),
            ])
            .send()
            .await
            .map_err(|e| Self::unavailable(&e))?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_for_response(response, "record_usage").await)
    }
}

/// Escape a value for the processor's search query language.
fn escape_search_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn call_status<T>(result: &Result<T, ScError>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

#[async_trait]
impl BillingGateway for StripeBillingClient {
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    async fn ensure_customer(&self, tenant_id: TenantId, email: &str) -> Result<String, ScError> {
        let start = Instant::now();
        let result = self.ensure_customer_inner(tenant_id, email).await;
        metrics::record_gateway_call(
            "billing",
            "ensure_customer",
            call_status(&result),
            start.elapsed(),
        );
        result
    }

    #[instrument(skip_all)]
    async fn pre_authorize(
        &self,
        customer_ref: &str,
        payment_method_id: &str,
        price_ref: Option<&str>,
    ) -> Result<String, ScError> {
        let start = Instant::now();
        let result = self
            .pre_authorize_inner(customer_ref, payment_method_id, price_ref)
            .await;
        metrics::record_gateway_call(
            "billing",
            "pre_authorize",
            call_status(&result),
            start.elapsed(),
        );
        result
    }

    #[instrument(skip_all, fields(meter_event = %meter_event))]
    async fn record_usage(
        &self,
        meter_event: &str,
        quantity: f64,
        customer_ref: &str,
        idempotency_key: &str,
    ) -> Result<(), ScError> {
        let start = Instant::now();
        let result = self
            .record_usage_inner(meter_event, quantity, customer_ref, idempotency_key)
            .await;
        metrics::record_gateway_call(
            "billing",
            "record_usage",
            call_status(&result),
            start.elapsed(),
        );
        result
    }
}

/// Mock billing gateway module for testing.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// A `record_usage` call the mock received.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedUsage {
        pub meter_event: String,
        pub quantity: f64,
        pub customer_ref: String,
        pub idempotency_key: String,
    }

    /// Mock billing gateway for unit testing.
    ///
    /// Each operation can be switched to fail independently, at any time.
    #[derive(Default)]
    pub struct MockBillingGateway {
        customers: Mutex<HashMap<(TenantId, String), String>>,
        usage: Mutex<Vec<RecordedUsage>>,
        pre_authorizations: AtomicUsize,
        usage_attempts: AtomicUsize,
        fail_customer: AtomicBool,
        fail_pre_authorize: AtomicBool,
        fail_record_usage: AtomicBool,
        record_delay: Option<Duration>,
    }

    impl MockBillingGateway {
        /// Create a mock where every call succeeds.
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a mock whose `ensure_customer` always fails.
        pub fn failing_customer() -> Self {
            let mock = Self::default();
            mock.fail_customer.store(true, Ordering::SeqCst);
            mock
        }

        /// Create a mock whose `pre_authorize` always fails.
        pub fn failing_pre_authorize() -> Self {
            let mock = Self::default();
            mock.fail_pre_authorize.store(true, Ordering::SeqCst);
            mock
        }

        /// Create a mock whose `record_usage` always fails.
        pub fn failing_record_usage() -> Self {
            let mock = Self::default();
            mock.fail_record_usage.store(true, Ordering::SeqCst);
            mock
        }

        /// Create a mock whose `record_usage` sleeps before answering.
        pub fn with_record_delay(delay: Duration) -> Self {
            Self {
                record_delay: Some(delay),
                ..Self::default()
            }
        }

        /// Toggle `record_usage` failures.
        pub fn set_fail_record_usage(&self, fail: bool) {
            self.fail_record_usage.store(fail, Ordering::SeqCst);
        }

        /// Successful `record_usage` calls, in the order they were accepted.
        pub async fn recorded_usage(&self) -> Vec<RecordedUsage> {
            self.usage.lock().await.clone()
        }

        /// `record_usage` calls made, including failed ones.
        pub fn usage_attempts(&self) -> usize {
            self.usage_attempts.load(Ordering::SeqCst)
        }

        /// Successful pre-authorizations.
        pub fn pre_authorization_count(&self) -> usize {
            self.pre_authorizations.load(Ordering::SeqCst)
        }

        /// Distinct customers created.
        pub async fn customer_count(&self) -> usize {
            self.customers.lock().await.len()
        }

        fn error() -> ScError {
            ScError::UpstreamUnavailable("Mock billing service error".to_string())
        }
    }

    #[async_trait]
    impl BillingGateway for MockBillingGateway {
        async fn ensure_customer(
            &self,
            tenant_id: TenantId,
            email: &str,
        ) -> Result<String, ScError> {
            if self.fail_customer.load(Ordering::SeqCst) {
                return Err(Self::error());
            }
            let mut customers = self.customers.lock().await;
            let next = customers.len() + 1;
            let customer = customers
                .entry((tenant_id, email.to_string()))
                .or_insert_with(|| format!("cus_mock_{next}"));
            Ok(customer.clone())
        }

        async fn pre_authorize(
            &self,
            _customer_ref: &str,
            _payment_method_id: &str,
            _price_ref: Option<&str>,
        ) -> Result<String, ScError> {
            if self.fail_pre_authorize.load(Ordering::SeqCst) {
                return Err(Self::error());
            }
            let count = self.pre_authorizations.fetch_add(1, Ordering::SeqCst);
            Ok(format!("pi_mock_{}", count + 1))
        }

        async fn record_usage(
            &self,
            meter_event: &str,
            quantity: f64,
            customer_ref: &str,
            idempotency_key: &str,
        ) -> Result<(), ScError> {
            self.usage_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.record_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_record_usage.load(Ordering::SeqCst) {
                return Err(Self::error());
            }
            self.usage.lock().await.push(RecordedUsage {
                meter_event: meter_event.to_string(),
                quantity,
                customer_ref: customer_ref.to_string(),
                idempotency_key: idempotency_key.to_string(),
            });
            Ok(())
        }
    }

}
