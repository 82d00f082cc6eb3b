//! Gateway webhook ingestion
//!
//! Verifies signatures, deduplicates deliveries, persists every event, and
//! dispatches to the reconciliation engine. Delivery is at-least-once and
//! may hit several instances concurrently; the claim on
//! `(org_id, provider_event_id)` is the linearization point. Handler
//! failures are recorded on the event row and never surfaced to the sender,
//! so the gateway's retry policy is not triggered by our own bugs.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::context::OrgContext;
use crate::error::{BillingError, BillingResult};
use crate::event::{EventKind, GatewayEvent};
use crate::reconciliation::ReconciliationEngine;
use crate::store::{BillingStore, ClaimOutcome, EventDisposition, NewWebhookEvent};

type HmacSha256 = Hmac<Sha256>;

/// Reject signatures whose timestamp is further than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A row still RECEIVED after this long is presumed crashed mid-handler and
/// may be re-claimed by a redelivery.
const PROCESSING_RECLAIM_MINUTES: i64 = 30;

/// Persisted processing state of a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Received => "received",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(WebhookEventStatus::Received),
            "processed" => Some(WebhookEventStatus::Processed),
            "failed" => Some(WebhookEventStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored webhook event. One row per `(org_id, provider_event_id)`, ever.
#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub raw_payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub error_detail: Option<String>,
}

/// What `ingest` tells its caller. All three are success at the boundary;
/// only signature and storage failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed,
    /// Handler failed; detail recorded on the event row.
    Failed { error: String },
    /// Already have this event; nothing was done.
    Duplicate,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Processed => "processed",
            IngestOutcome::Failed { .. } => "failed",
            IngestOutcome::Duplicate => "duplicate",
        }
    }
}

pub struct WebhookIngestor {
    store: Arc<dyn BillingStore>,
    engine: ReconciliationEngine,
    webhook_secret: String,
}

impl WebhookIngestor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        engine: ReconciliationEngine,
        webhook_secret: String,
    ) -> Self {
        Self {
            store,
            engine,
            webhook_secret,
        }
    }

    /// Verify the signature header and parse the payload.
    ///
    /// Header format: `t=<unix>,v1=<hex>[,v1=<hex>...]`. The signed string
    /// is `"{t}.{payload}"`, HMAC-SHA256 under the webhook secret (any
    /// `whsec_` prefix stripped). Runs before any persistence; this is the
    /// only failure a webhook sender ever sees.
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<GatewayEvent> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<String> = Vec::new();

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0].trim() {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => candidates.push(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Webhook signature header missing timestamp");
            BillingError::SignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Webhook signature header missing v1 signature");
            return Err(BillingError::SignatureInvalid);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        // The secret's "whsec_" prefix is not part of the key material.
        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Webhook secret is not a valid HMAC key");
            BillingError::SignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        let matched = candidates
            .iter()
            .any(|candidate| computed.as_bytes().ct_eq(candidate.as_bytes()).into());
        if !matched {
            tracing::warn!(
                candidates = candidates.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::SignatureInvalid);
        }

        GatewayEvent::from_json(payload)
    }

    /// Dedup, persist, dispatch.
    ///
    /// Atomically claims the event; duplicates are logged no-ops. On claim,
    /// dispatches to the reconciliation engine and records the outcome on
    /// the row. Handler errors come back as `IngestOutcome::Failed`, never
    /// as `Err`, so the sender gets its fast acknowledgment either way.
    pub async fn ingest(
        &self,
        ctx: &OrgContext,
        event: GatewayEvent,
    ) -> BillingResult<IngestOutcome> {
        let claim = self
            .store
            .claim_event(
                ctx,
                NewWebhookEvent {
                    provider_event_id: event.provider_event_id.clone(),
                    event_type: event.event_type.clone(),
                    raw_payload: event.raw.clone(),
                    received_at: OffsetDateTime::now_utc(),
                },
                Duration::minutes(PROCESSING_RECLAIM_MINUTES),
            )
            .await?;

        if let ClaimOutcome::Duplicate { existing } = claim {
            let reason = match existing {
                Some(WebhookEventStatus::Processed) => "already processed successfully",
                Some(WebhookEventStatus::Received) => "currently being processed by another worker",
                Some(WebhookEventStatus::Failed) => "previously failed; kept for operator review",
                None => "unknown (race between claim and read)",
            };
            tracing::info!(
                org_id = %ctx.org_id,
                event_id = %event.provider_event_id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate webhook event - atomic idempotency check"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        tracing::info!(
            org_id = %ctx.org_id,
            event_id = %event.provider_event_id,
            event_type = %event.event_type,
            "Processing webhook event (claimed exclusive processing rights)"
        );

        let result = self.dispatch(ctx, &event).await;

        let disposition = match &result {
            Ok(()) => EventDisposition::Processed {
                at: OffsetDateTime::now_utc(),
            },
            Err(e) => EventDisposition::Failed {
                error: e.to_string(),
            },
        };

        // Record the outcome; retry once. The row is what operators see,
        // and a row stuck RECEIVED is only recovered by the claim timeout.
        if let Err(e) = self
            .store
            .complete_event(ctx, &event.provider_event_id, disposition.clone())
            .await
        {
            tracing::warn!(
                event_id = %event.provider_event_id,
                error = %e,
                "First attempt to record webhook outcome failed, retrying..."
            );
            if let Err(retry_err) = self
                .store
                .complete_event(ctx, &event.provider_event_id, disposition)
                .await
            {
                tracing::error!(
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: failed to record webhook outcome after retry. \
                     Event will appear stuck RECEIVED until the claim timeout \
                     allows a redelivery to reprocess it."
                );
            }
        }

        match result {
            Ok(()) => Ok(IngestOutcome::Processed),
            Err(e) => {
                tracing::error!(
                    org_id = %ctx.org_id,
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed; error recorded on event row"
                );
                Ok(IngestOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn dispatch(&self, ctx: &OrgContext, event: &GatewayEvent) -> BillingResult<()> {
        match &event.kind {
            EventKind::SubscriptionCreated(payload) | EventKind::SubscriptionUpdated(payload) => {
                self.engine.apply_subscription_event(ctx, payload).await
            }
            EventKind::SubscriptionDeleted(payload) => {
                self.engine.apply_subscription_deleted(ctx, payload).await
            }
            EventKind::InvoicePaid(payload) => self.engine.apply_invoice_paid(ctx, payload).await,
            EventKind::InvoicePaymentFailed(payload) => {
                self.engine.apply_invoice_payment_failed(ctx, payload).await
            }
            EventKind::Unknown => {
                tracing::info!(
                    org_id = %ctx.org_id,
                    event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    "Unhandled gateway event type; acknowledged with no side effects"
                );
                Ok(())
            }
        }
    }

    /// Failed events for operator inspection, newest first.
    pub async fn failed_events(&self, ctx: &OrgContext) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.failed_events(ctx).await
    }
}
