//! Reconciliation of local billing state from gateway events
//!
//! The gateway is the source of truth for subscription and invoice state;
//! these handlers fold its events into our rows. Every handler is
//! idempotent (upserts keyed by the external id) and tolerant of
//! out-of-order and partial payloads: absent fields never overwrite stored
//! values.

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::context::OrgContext;
use crate::error::BillingResult;
use crate::event::{InvoicePayload, SubscriptionPayload};
use crate::notify::{Notifier, PaymentFailed, PaymentSucceeded, SubscriptionCancelled};
use crate::store::{BillingStore, InvoicePatch, SubscriptionPatch};

/// When the gateway does not name a retry date for a failed payment, assume
/// it retries in this many days.
const DEFAULT_RETRY_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
    Expired,
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "suspended" => Some(SubscriptionStatus::Suspended),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Failed,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InvoiceStatus::Draft),
            "open" => Some(InvoiceStatus::Open),
            "paid" => Some(InvoiceStatus::Paid),
            "failed" => Some(InvoiceStatus::Failed),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Local mirror of a gateway subscription, keyed by
/// `(org_id, external_subscription_id)`.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub org_id: Uuid,
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Local mirror of a gateway invoice, keyed by
/// `(org_id, external_invoice_id)`.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub id: Uuid,
    pub org_id: Uuid,
    pub external_invoice_id: String,
    pub external_subscription_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

/// Maps the gateway's subscription status vocabulary onto ours. Returns
/// `None` for statuses we do not model, which leaves the stored value
/// untouched.
fn map_provider_status(raw: &str) -> Option<SubscriptionStatus> {
    match raw {
        "trialing" => Some(SubscriptionStatus::Trial),
        "active" => Some(SubscriptionStatus::Active),
        "past_due" => Some(SubscriptionStatus::PastDue),
        "canceled" | "cancelled" => Some(SubscriptionStatus::Cancelled),
        "incomplete_expired" => Some(SubscriptionStatus::Expired),
        "unpaid" | "paused" => Some(SubscriptionStatus::Suspended),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn BillingStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// `customer.subscription.created` / `customer.subscription.updated`:
    /// upsert the mirror row from whatever fields the payload carries.
    pub async fn apply_subscription_event(
        &self,
        ctx: &OrgContext,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let status = match payload.status.as_deref() {
            Some(raw) => {
                let mapped = map_provider_status(raw);
                if mapped.is_none() {
                    tracing::debug!(
                        org_id = %ctx.org_id,
                        subscription_id = %payload.id,
                        provider_status = %raw,
                        "Unrecognized provider subscription status; keeping stored status"
                    );
                }
                mapped
            }
            None => None,
        };

        let sub = self
            .store
            .upsert_subscription(
                ctx,
                &payload.id,
                SubscriptionPatch {
                    external_customer_id: payload.customer.clone(),
                    status,
                    current_period_start: payload.current_period_start_at(),
                    current_period_end: payload.current_period_end_at(),
                    trial_start: payload.trial_start_at(),
                    trial_end: payload.trial_end_at(),
                    cancel_at_period_end: payload.cancel_at_period_end,
                    cancelled_at: None,
                },
            )
            .await?;

        tracing::info!(
            org_id = %ctx.org_id,
            subscription_id = %payload.id,
            status = %sub.status,
            "Reconciled subscription from gateway event"
        );
        Ok(())
    }

    /// `invoice.paid`: mark the invoice paid, recover a past-due
    /// subscription, and tell the customer.
    pub async fn apply_invoice_paid(
        &self,
        ctx: &OrgContext,
        payload: &InvoicePayload,
    ) -> BillingResult<()> {
        let amount_cents = payload.amount_paid.or(payload.amount_due).unwrap_or(0);
        let currency = payload
            .currency
            .clone()
            .unwrap_or_else(|| "usd".to_string());

        self.store
            .upsert_invoice(
                ctx,
                &payload.id,
                InvoicePatch {
                    external_subscription_id: payload.subscription.clone(),
                    amount_cents: Some(amount_cents),
                    currency: Some(currency.clone()),
                    status: Some(InvoiceStatus::Paid),
                    period_start: payload.period_start_at(),
                    period_end: payload.period_end_at(),
                    paid_at: Some(OffsetDateTime::now_utc()),
                },
            )
            .await?;

        if let Some(subscription_id) = &payload.subscription {
            let recovered = self
                .store
                .recover_subscription_if_past_due(ctx, subscription_id)
                .await?;
            if recovered {
                tracing::info!(
                    org_id = %ctx.org_id,
                    subscription_id = %subscription_id,
                    invoice_id = %payload.id,
                    "Subscription recovered from past_due after successful payment"
                );
            }
        }

        tracing::info!(
            org_id = %ctx.org_id,
            invoice_id = %payload.id,
            amount_cents = amount_cents,
            "Invoice reconciled as paid"
        );

        let note = PaymentSucceeded {
            external_customer_id: payload.customer.clone(),
            external_invoice_id: payload.id.clone(),
            amount_cents,
            currency,
        };
        if let Err(e) = self.notifier.payment_succeeded(ctx, note).await {
            tracing::warn!(
                org_id = %ctx.org_id,
                invoice_id = %payload.id,
                error = %e,
                "Failed to dispatch payment-success notification"
            );
        }
        Ok(())
    }

    /// `invoice.payment_failed`: mark the invoice failed, move the
    /// subscription to past_due, and tell the customer when the gateway
    /// will retry.
    pub async fn apply_invoice_payment_failed(
        &self,
        ctx: &OrgContext,
        payload: &InvoicePayload,
    ) -> BillingResult<()> {
        let amount_cents = payload.amount_due.or(payload.amount_paid).unwrap_or(0);
        let currency = payload
            .currency
            .clone()
            .unwrap_or_else(|| "usd".to_string());

        self.store
            .upsert_invoice(
                ctx,
                &payload.id,
                InvoicePatch {
                    external_subscription_id: payload.subscription.clone(),
                    amount_cents: Some(amount_cents),
                    currency: Some(currency.clone()),
                    status: Some(InvoiceStatus::Failed),
                    period_start: payload.period_start_at(),
                    period_end: payload.period_end_at(),
                    paid_at: None,
                },
            )
            .await?;

        if let Some(subscription_id) = &payload.subscription {
            self.store
                .upsert_subscription(
                    ctx,
                    subscription_id,
                    SubscriptionPatch {
                        external_customer_id: payload.customer.clone(),
                        status: Some(SubscriptionStatus::PastDue),
                        current_period_start: None,
                        current_period_end: None,
                        trial_start: None,
                        trial_end: None,
                        cancel_at_period_end: None,
                        cancelled_at: None,
                    },
                )
                .await?;
        }

        let next_retry_at = payload
            .next_payment_attempt_at()
            .unwrap_or_else(|| OffsetDateTime::now_utc() + Duration::days(DEFAULT_RETRY_DAYS));
        let reason = payload
            .failure_message
            .clone()
            .unwrap_or_else(|| "payment attempt failed".to_string());

        tracing::warn!(
            org_id = %ctx.org_id,
            invoice_id = %payload.id,
            subscription_id = payload.subscription.as_deref().unwrap_or("-"),
            next_retry_at = %next_retry_at,
            "Invoice payment failed; subscription marked past_due"
        );

        let note = PaymentFailed {
            external_customer_id: payload.customer.clone(),
            external_invoice_id: payload.id.clone(),
            amount_cents,
            currency,
            reason,
            next_retry_at,
        };
        if let Err(e) = self.notifier.payment_failed(ctx, note).await {
            tracing::warn!(
                org_id = %ctx.org_id,
                invoice_id = %payload.id,
                error = %e,
                "Failed to dispatch payment-failure notification"
            );
        }
        Ok(())
    }

    /// `customer.subscription.deleted`: terminal cancellation. Access runs
    /// until the end of the already-paid period.
    pub async fn apply_subscription_deleted(
        &self,
        ctx: &OrgContext,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let sub = self
            .store
            .upsert_subscription(
                ctx,
                &payload.id,
                SubscriptionPatch {
                    external_customer_id: payload.customer.clone(),
                    status: Some(SubscriptionStatus::Cancelled),
                    current_period_start: payload.current_period_start_at(),
                    current_period_end: payload.current_period_end_at(),
                    trial_start: None,
                    trial_end: None,
                    cancel_at_period_end: payload.cancel_at_period_end,
                    cancelled_at: Some(OffsetDateTime::now_utc()),
                },
            )
            .await?;

        tracing::info!(
            org_id = %ctx.org_id,
            subscription_id = %payload.id,
            access_until = sub
                .current_period_end
                .map(|t| t.to_string())
                .as_deref()
                .unwrap_or("-"),
            "Subscription cancelled"
        );

        let note = SubscriptionCancelled {
            external_customer_id: sub.external_customer_id.clone(),
            external_subscription_id: payload.id.clone(),
            // The merged row's period end: the payload's if it carried one,
            // otherwise whatever an earlier event stored.
            access_until: sub.current_period_end,
        };
        if let Err(e) = self.notifier.subscription_cancelled(ctx, note).await {
            tracing::warn!(
                org_id = %ctx.org_id,
                subscription_id = %payload.id,
                error = %e,
                "Failed to dispatch cancellation notification"
            );
        }
        Ok(())
    }
}
