//! Gateway event model
//!
//! Parses the provider's webhook envelope (`{id, type, created, data.object}`)
//! into a closed set of event kinds. Dispatch over `EventKind` is an
//! exhaustive match; event types this crate does not handle land in
//! `Unknown` and are logged by the ingestor, never silently dropped.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// A parsed gateway event, produced only after signature verification.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// Provider-assigned event id; the dedup key.
    pub provider_event_id: String,
    /// Raw `type` string as sent by the provider.
    pub event_type: String,
    pub created: OffsetDateTime,
    pub kind: EventKind,
    /// Full envelope as received; persisted alongside the event row.
    pub raw: Value,
}

/// Closed set of event kinds this system reconciles.
#[derive(Debug, Clone)]
pub enum EventKind {
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    InvoicePaid(InvoicePayload),
    InvoicePaymentFailed(InvoicePayload),
    /// Recognized envelope, unhandled type. Recorded and acknowledged with
    /// no side effects.
    Unknown,
}

impl EventKind {
    pub fn is_unknown(&self) -> bool {
        matches!(self, EventKind::Unknown)
    }
}

/// Subscription object as carried by `customer.subscription.*` events.
///
/// Every field except `id` is optional: the reconciliation merge only
/// overwrites fields the payload actually carries.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer: Option<String>,
    pub status: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_start: Option<i64>,
    pub trial_end: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
}

impl SubscriptionPayload {
    pub fn current_period_start_at(&self) -> Option<OffsetDateTime> {
        self.current_period_start.and_then(unix_ts)
    }

    pub fn current_period_end_at(&self) -> Option<OffsetDateTime> {
        self.current_period_end.and_then(unix_ts)
    }

    pub fn trial_start_at(&self) -> Option<OffsetDateTime> {
        self.trial_start.and_then(unix_ts)
    }

    pub fn trial_end_at(&self) -> Option<OffsetDateTime> {
        self.trial_end.and_then(unix_ts)
    }
}

/// Invoice object as carried by `invoice.*` events. Amounts are minor units.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    pub subscription: Option<String>,
    pub customer: Option<String>,
    pub amount_due: Option<i64>,
    pub amount_paid: Option<i64>,
    pub currency: Option<String>,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
    /// Gateway-scheduled next retry for a failed payment, unix seconds.
    pub next_payment_attempt: Option<i64>,
    pub failure_message: Option<String>,
}

impl InvoicePayload {
    pub fn period_start_at(&self) -> Option<OffsetDateTime> {
        self.period_start.and_then(unix_ts)
    }

    pub fn period_end_at(&self) -> Option<OffsetDateTime> {
        self.period_end.and_then(unix_ts)
    }

    pub fn next_payment_attempt_at(&self) -> Option<OffsetDateTime> {
        self.next_payment_attempt.and_then(unix_ts)
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<i64>,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

fn unix_ts(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

impl GatewayEvent {
    /// Parse a raw webhook body into a typed event.
    ///
    /// Called after signature verification; the raw envelope is kept so the
    /// event row stores exactly what the provider sent.
    pub fn from_json(payload: &str) -> BillingResult<Self> {
        let raw: Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidPayload(format!("envelope is not JSON: {}", e)))?;

        let envelope: Envelope = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::InvalidPayload(format!("malformed envelope: {}", e)))?;

        let created = envelope
            .created
            .and_then(unix_ts)
            .unwrap_or_else(OffsetDateTime::now_utc);

        let kind = match envelope.event_type.as_str() {
            "customer.subscription.created" => {
                EventKind::SubscriptionCreated(parse_object(&envelope, envelope.data.object.clone())?)
            }
            "customer.subscription.updated" => {
                EventKind::SubscriptionUpdated(parse_object(&envelope, envelope.data.object.clone())?)
            }
            "customer.subscription.deleted" => {
                EventKind::SubscriptionDeleted(parse_object(&envelope, envelope.data.object.clone())?)
            }
            // Some provider API versions emit `invoice.payment_succeeded`
            // instead of `invoice.paid`; they carry the same object.
            "invoice.paid" | "invoice.payment_succeeded" => {
                EventKind::InvoicePaid(parse_object(&envelope, envelope.data.object.clone())?)
            }
            "invoice.payment_failed" => {
                EventKind::InvoicePaymentFailed(parse_object(&envelope, envelope.data.object.clone())?)
            }
            _ => EventKind::Unknown,
        };

        Ok(Self {
            provider_event_id: envelope.id,
            event_type: envelope.event_type,
            created,
            kind,
            raw,
        })
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(
    envelope: &Envelope,
    object: Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::InvalidPayload(format!(
            "{} object did not match expected shape: {}",
            envelope.event_type, e
        ))
    })
}
