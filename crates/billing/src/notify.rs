//! Member notification dispatch
//!
//! Fire-and-forget collaborator: the reconciliation engine reports payment
//! outcomes here, and a failed dispatch is a logged warning, never a reason
//! to roll back a financial state change. Delivery itself (email, push) is
//! owned by another system; the production implementation emits structured
//! log events that the delivery pipeline consumes.

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::context::OrgContext;
use crate::error::BillingResult;

#[derive(Debug, Clone)]
pub struct PaymentSucceeded {
    pub external_customer_id: Option<String>,
    pub external_invoice_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct PaymentFailed {
    pub external_customer_id: Option<String>,
    pub external_invoice_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: String,
    /// When the gateway will retry, or our own now+3d default.
    pub next_retry_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SubscriptionCancelled {
    pub external_customer_id: Option<String>,
    pub external_subscription_id: String,
    /// Member keeps access until the end of the already-paid period.
    pub access_until: Option<OffsetDateTime>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn payment_succeeded(&self, ctx: &OrgContext, note: PaymentSucceeded)
        -> BillingResult<()>;
    async fn payment_failed(&self, ctx: &OrgContext, note: PaymentFailed) -> BillingResult<()>;
    async fn subscription_cancelled(
        &self,
        ctx: &OrgContext,
        note: SubscriptionCancelled,
    ) -> BillingResult<()>;
}

/// Production notifier: structured log events only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn payment_succeeded(
        &self,
        ctx: &OrgContext,
        note: PaymentSucceeded,
    ) -> BillingResult<()> {
        tracing::info!(
            org_id = %ctx.org_id,
            invoice_id = %note.external_invoice_id,
            customer_id = ?note.external_customer_id,
            amount_cents = note.amount_cents,
            currency = %note.currency,
            "Notification: payment succeeded"
        );
        Ok(())
    }

    async fn payment_failed(&self, ctx: &OrgContext, note: PaymentFailed) -> BillingResult<()> {
        tracing::info!(
            org_id = %ctx.org_id,
            invoice_id = %note.external_invoice_id,
            customer_id = ?note.external_customer_id,
            amount_cents = note.amount_cents,
            reason = %note.reason,
            next_retry_at = %note.next_retry_at,
            "Notification: payment failed"
        );
        Ok(())
    }

    async fn subscription_cancelled(
        &self,
        ctx: &OrgContext,
        note: SubscriptionCancelled,
    ) -> BillingResult<()> {
        tracing::info!(
            org_id = %ctx.org_id,
            subscription_id = %note.external_subscription_id,
            customer_id = ?note.external_customer_id,
            access_until = ?note.access_until,
            "Notification: subscription cancelled"
        );
        Ok(())
    }
}

/// Everything a test needs to assert on dispatched notifications.
#[derive(Debug, Clone)]
pub enum RecordedNotification {
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
    SubscriptionCancelled(SubscriptionCancelled),
}

#[derive(Debug, Default)]
struct RecordingState {
    sent: Vec<RecordedNotification>,
    fail_all: bool,
}

/// Test notifier: captures every dispatch; can be told to fail so callers'
/// warn-and-continue behavior is checkable.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    inner: Arc<Mutex<RecordingState>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_all(&self, fail: bool) {
        self.inner.lock().await.fail_all = fail;
    }

    pub async fn sent(&self) -> Vec<RecordedNotification> {
        self.inner.lock().await.sent.clone()
    }

    pub async fn total(&self) -> usize {
        self.inner.lock().await.sent.len()
    }

    pub async fn payment_failed_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sent
            .iter()
            .filter(|n| matches!(n, RecordedNotification::PaymentFailed(_)))
            .count()
    }

    pub async fn payment_succeeded_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sent
            .iter()
            .filter(|n| matches!(n, RecordedNotification::PaymentSucceeded(_)))
            .count()
    }

    pub async fn cancellation_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sent
            .iter()
            .filter(|n| matches!(n, RecordedNotification::SubscriptionCancelled(_)))
            .count()
    }

    async fn record(&self, note: RecordedNotification) -> BillingResult<()> {
        let mut state = self.inner.lock().await;
        if state.fail_all {
            return Err(crate::error::BillingError::Config(
                "notifier configured to fail".to_string(),
            ));
        }
        state.sent.push(note);
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn payment_succeeded(
        &self,
        _ctx: &OrgContext,
        note: PaymentSucceeded,
    ) -> BillingResult<()> {
        self.record(RecordedNotification::PaymentSucceeded(note)).await
    }

    async fn payment_failed(&self, _ctx: &OrgContext, note: PaymentFailed) -> BillingResult<()> {
        self.record(RecordedNotification::PaymentFailed(note)).await
    }

    async fn subscription_cancelled(
        &self,
        _ctx: &OrgContext,
        note: SubscriptionCancelled,
    ) -> BillingResult<()> {
        self.record(RecordedNotification::SubscriptionCancelled(note))
            .await
    }
}
