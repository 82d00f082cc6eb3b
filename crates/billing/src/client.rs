//! Payment gateway client
//!
//! The workflow talks to the gateway through the `PaymentGateway` trait:
//! execute a refund against a captured payment, and list the refunds the
//! gateway holds for a payment (used by the reconciliation report).
//!
//! `StripeGateway` is the production implementation, speaking the provider's
//! REST API directly with form-encoded requests. `MockGateway` scripts
//! responses for tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};

/// Gateway credentials and endpoints, loaded from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub secret_key: String,
    /// Shared secret for webhook signature verification (`whsec_` prefixed).
    pub webhook_secret: String,
    pub api_base: String,
}

impl GatewayConfig {
    /// Reads `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` and the optional
    /// `STRIPE_API_BASE` override.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let api_base = std::env::var("STRIPE_API_BASE")
            .unwrap_or_else(|_| "https://api.stripe.com".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// A refund as the gateway reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayRefund {
    #[serde(rename = "id")]
    pub refund_id: String,
    pub status: String,
    #[serde(rename = "amount")]
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    data: Vec<GatewayRefund>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Execute a refund against a captured payment. A failure leaves no
    /// local state behind; the caller decides what to do with it.
    async fn create_refund(
        &self,
        payment_reference: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<GatewayRefund>;

    /// All refunds the gateway holds for a payment, newest first.
    async fn list_refunds(&self, payment_reference: &str) -> BillingResult<Vec<GatewayRefund>>;
}

/// Production gateway client.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl StripeGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn refund_error(message: String, retriable: bool) -> BillingError {
        BillingError::GatewayRefund { message, retriable }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_refund(
        &self,
        payment_reference: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<GatewayRefund> {
        let url = format!("{}/v1/refunds", self.config.api_base);

        let mut form: Vec<(&str, String)> = vec![
            ("charge", payment_reference.to_string()),
            ("amount", amount_cents.to_string()),
        ];
        if let Some(reason) = reason {
            // Free-text reasons go in metadata; the provider's own `reason`
            // field only accepts its fixed vocabulary.
            form.push(("metadata[reason]", reason.to_string()));
        }

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(|e| Self::refund_error(format!("refund request failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retriable = status.is_server_error() || status.as_u16() == 429;
            tracing::error!(
                payment_reference = %payment_reference,
                status = %status,
                retriable = retriable,
                body = %body,
                "Gateway rejected refund call"
            );
            return Err(Self::refund_error(
                format!("gateway returned {}: {}", status, body),
                retriable,
            ));
        }

        let refund: GatewayRefund = response.json().await.map_err(|e| {
            Self::refund_error(format!("could not parse refund response: {}", e), false)
        })?;

        tracing::info!(
            payment_reference = %payment_reference,
            refund_id = %refund.refund_id,
            refund_status = %refund.status,
            amount_cents = amount_cents,
            "Gateway refund created"
        );
        Ok(refund)
    }

    async fn list_refunds(&self, payment_reference: &str) -> BillingResult<Vec<GatewayRefund>> {
        let url = format!("{}/v1/refunds", self.config.api_base);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.secret_key, None::<&str>)
            .query(&[("charge", payment_reference), ("limit", "100")])
            .send()
            .await
            .map_err(|e| Self::refund_error(format!("refund listing failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::refund_error(
                format!("refund listing returned {}: {}", status, body),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }

        let list: RefundList = response.json().await.map_err(|e| {
            Self::refund_error(format!("could not parse refund list: {}", e), false)
        })?;
        Ok(list.data)
    }
}

#[derive(Debug, Default)]
struct MockGatewayState {
    scripted: Vec<Result<GatewayRefund, (String, bool)>>,
    listed: HashMap<String, Vec<GatewayRefund>>,
    calls: Vec<String>,
    last_refund: Option<(String, i64, Option<String>)>,
    generated: u64,
}

/// Scriptable in-memory gateway for tests.
///
/// With no scripted results, `create_refund` succeeds with a generated
/// refund id. Successful refunds are also visible through `list_refunds`,
/// matching how the live gateway behaves.
#[derive(Debug, Clone, Default)]
pub struct MockGateway {
    inner: Arc<Mutex<MockGatewayState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `create_refund` call to succeed with this refund id.
    pub async fn succeed_with(&self, refund_id: &str) {
        self.inner.lock().await.scripted.push(Ok(GatewayRefund {
            refund_id: refund_id.to_string(),
            status: "succeeded".to_string(),
            amount_cents: None,
        }));
    }

    /// Script the next `create_refund` call to fail.
    pub async fn fail_next(&self, message: &str, retriable: bool) {
        self.inner
            .lock()
            .await
            .scripted
            .push(Err((message.to_string(), retriable)));
    }

    /// Seed a refund the gateway already holds for a payment.
    pub async fn add_existing_refund(&self, payment_reference: &str, refund: GatewayRefund) {
        self.inner
            .lock()
            .await
            .listed
            .entry(payment_reference.to_string())
            .or_default()
            .push(refund);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn call_count(&self, method: &str) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub async fn was_called(&self, method: &str) -> bool {
        self.call_count(method).await > 0
    }

    /// Payment reference, amount and reason of the most recent refund call.
    pub async fn last_refund(&self) -> Option<(String, i64, Option<String>)> {
        self.inner.lock().await.last_refund.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_refund(
        &self,
        payment_reference: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<GatewayRefund> {
        let mut state = self.inner.lock().await;
        state.calls.push("create_refund".to_string());
        state.last_refund = Some((
            payment_reference.to_string(),
            amount_cents,
            reason.map(|r| r.to_string()),
        ));

        let result = if state.scripted.is_empty() {
            state.generated += 1;
            Ok(GatewayRefund {
                refund_id: format!("re_mock_{}", state.generated),
                status: "succeeded".to_string(),
                amount_cents: Some(amount_cents),
            })
        } else {
            state.scripted.remove(0)
        };

        match result {
            Ok(mut refund) => {
                if refund.amount_cents.is_none() {
                    refund.amount_cents = Some(amount_cents);
                }
                state
                    .listed
                    .entry(payment_reference.to_string())
                    .or_default()
                    .push(refund.clone());
                Ok(refund)
            }
            Err((message, retriable)) => Err(BillingError::GatewayRefund { message, retriable }),
        }
    }

    async fn list_refunds(&self, payment_reference: &str) -> BillingResult<Vec<GatewayRefund>> {
        let mut state = self.inner.lock().await;
        state.calls.push("list_refunds".to_string());
        Ok(state
            .listed
            .get(payment_reference)
            .cloned()
            .unwrap_or_default())
    }
}
