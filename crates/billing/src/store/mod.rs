//! Persistence seam for the billing subsystem
//!
//! Services depend on `BillingStore`, not on a concrete database. `PgStore`
//! is the production implementation; `MemoryStore` gives the same semantics
//! over mutex-guarded maps for tests and local development. The contract
//! notes on each method are binding: the webhook claim and the refund
//! transitions are the crate's two linearization points, and both
//! implementations must make them atomic.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::RefundAuditEntry;
use crate::context::OrgContext;
use crate::error::BillingResult;
use crate::reconciliation::{Invoice, InvoiceStatus, Subscription, SubscriptionStatus};
use crate::refunds::{RefundRequest, RefundStatus};
use crate::webhooks::{WebhookEventRecord, WebhookEventStatus};

/// Insert form of a webhook event row.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub raw_payload: serde_json::Value,
    pub received_at: OffsetDateTime,
}

/// Result of the atomic claim on `(org_id, provider_event_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns processing for the event.
    Claimed,
    /// The key already exists; carries the stored status for logging.
    /// `None` means the row vanished between the claim and the follow-up
    /// read, which only a concurrent reclaim can cause.
    Duplicate {
        existing: Option<WebhookEventStatus>,
    },
}

/// Terminal disposition written back after dispatch.
#[derive(Debug, Clone)]
pub enum EventDisposition {
    Processed { at: OffsetDateTime },
    Failed { error: String },
}

/// Fields a subscription event may carry. `Some` overwrites, `None` leaves
/// the stored value alone (per-field last-write-wins).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub external_customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub cancelled_at: Option<OffsetDateTime>,
}

/// Same merge rules as `SubscriptionPatch`, for invoices.
#[derive(Debug, Clone, Default)]
pub struct InvoicePatch {
    pub external_subscription_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

/// Outcome of inserting a refund request under the one-pending-per-payment
/// constraint.
#[derive(Debug, Clone)]
pub enum RefundInsert {
    Inserted(RefundRequest),
    /// A PENDING request for the same payment reference already exists.
    PendingExists,
}

/// State change applied by `transition_refund`, guarded by the expected
/// status list. `BeginProcess` claims an APPROVED row before the gateway
/// call and `AbortProcess` releases the claim if that call fails;
/// `Escalate` is the one change that leaves `status` untouched.
#[derive(Debug, Clone)]
pub enum RefundChange {
    Approve {
        approved_by: Uuid,
    },
    Reject {
        rejected_by: Uuid,
        reason: String,
    },
    Cancel,
    BeginProcess {
        started_at: OffsetDateTime,
    },
    Process {
        linked_refund_id: String,
        processed_at: OffsetDateTime,
    },
    AbortProcess,
    Escalate {
        escalated_to: String,
    },
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Atomically claim an event for processing.
    ///
    /// Exactly one concurrent caller per `(org_id, provider_event_id)` gets
    /// `Claimed`; everyone else gets `Duplicate`. A row still `Received`
    /// after `reclaim_after` is treated as a crashed prior attempt and
    /// re-claimed by the next delivery (its `received_at` is refreshed so
    /// only one redelivery wins the reclaim too).
    async fn claim_event(
        &self,
        ctx: &OrgContext,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimOutcome>;

    /// Record the handler outcome on a claimed event row.
    async fn complete_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
        disposition: EventDisposition,
    ) -> BillingResult<()>;

    async fn get_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>>;

    /// Failed events, newest first, for operator inspection.
    async fn failed_events(&self, ctx: &OrgContext) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Create-or-merge by external id. Creates a shell row when absent;
    /// only `Some` patch fields overwrite. Safe to repeat.
    async fn upsert_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Subscription>;

    async fn get_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Guarded PAST_DUE to ACTIVE recovery: returns true only when the row
    /// was actually PAST_DUE. Any other status (or no row) is a no-op.
    async fn recover_subscription_if_past_due(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<bool>;

    async fn upsert_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
        patch: InvoicePatch,
    ) -> BillingResult<Invoice>;

    async fn get_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>>;

    /// Insert a new request unless a PENDING one already exists for the
    /// same payment reference. The check and insert are one atomic step.
    async fn insert_refund_request(
        &self,
        ctx: &OrgContext,
        request: RefundRequest,
    ) -> BillingResult<RefundInsert>;

    async fn get_refund_request(
        &self,
        ctx: &OrgContext,
        id: Uuid,
    ) -> BillingResult<Option<RefundRequest>>;

    /// Compare-and-swap transition: applies `change` only if the current
    /// status is in `expected`, returning the updated row. `None` means the
    /// guard failed (or the row does not exist in this org); the caller
    /// re-reads to distinguish. Concurrent callers on one row see exactly
    /// one `Some`.
    async fn transition_refund(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        expected: &[RefundStatus],
        change: RefundChange,
    ) -> BillingResult<Option<RefundRequest>>;

    /// PENDING requests past their SLA deadline, oldest deadline first.
    async fn overdue_refund_requests(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<RefundRequest>>;

    async fn refund_requests_with_status(
        &self,
        ctx: &OrgContext,
        statuses: &[RefundStatus],
    ) -> BillingResult<Vec<RefundRequest>>;

    /// Append-only; entries are never updated or deleted.
    async fn append_audit(&self, ctx: &OrgContext, entry: RefundAuditEntry) -> BillingResult<()>;

    /// Full trail for a request in creation order.
    async fn audit_trail(
        &self,
        ctx: &OrgContext,
        refund_request_id: Uuid,
    ) -> BillingResult<Vec<RefundAuditEntry>>;
}
