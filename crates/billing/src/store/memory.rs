//! In-memory `BillingStore`
//!
//! One mutex over the whole state: every store operation is a single
//! critical section, which is exactly the atomicity the claim and the
//! refund transitions require. Used by the test suites and usable for
//! local development without Postgres.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::RefundAuditEntry;
use crate::context::OrgContext;
use crate::error::{BillingError, BillingResult};
use crate::reconciliation::{Invoice, InvoiceStatus, Subscription, SubscriptionStatus};
use crate::refunds::{RefundRequest, RefundStatus};
use crate::webhooks::{WebhookEventRecord, WebhookEventStatus};

use super::{
    BillingStore, ClaimOutcome, EventDisposition, InvoicePatch, NewWebhookEvent, RefundChange,
    RefundInsert, SubscriptionPatch,
};

#[derive(Debug, Default)]
struct MemoryState {
    events: HashMap<(Uuid, String), WebhookEventRecord>,
    subscriptions: HashMap<(Uuid, String), Subscription>,
    invoices: HashMap<(Uuid, String), Invoice>,
    refunds: HashMap<Uuid, RefundRequest>,
    audit: Vec<RefundAuditEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of webhook event rows across all orgs. Test helper.
    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Number of refund request rows across all orgs. Test helper.
    pub async fn refund_count(&self) -> usize {
        self.inner.lock().await.refunds.len()
    }
}

fn apply_subscription_patch(sub: &mut Subscription, patch: SubscriptionPatch) {
    if let Some(v) = patch.external_customer_id {
        sub.external_customer_id = Some(v);
    }
    if let Some(v) = patch.status {
        sub.status = v;
    }
    if let Some(v) = patch.current_period_start {
        sub.current_period_start = Some(v);
    }
    if let Some(v) = patch.current_period_end {
        sub.current_period_end = Some(v);
    }
    if let Some(v) = patch.trial_start {
        sub.trial_start = Some(v);
    }
    if let Some(v) = patch.trial_end {
        sub.trial_end = Some(v);
    }
    if let Some(v) = patch.cancel_at_period_end {
        sub.cancel_at_period_end = v;
    }
    if let Some(v) = patch.cancelled_at {
        sub.cancelled_at = Some(v);
    }
}

fn apply_invoice_patch(invoice: &mut Invoice, patch: InvoicePatch) {
    if let Some(v) = patch.external_subscription_id {
        invoice.external_subscription_id = Some(v);
    }
    if let Some(v) = patch.amount_cents {
        invoice.amount_cents = v;
    }
    if let Some(v) = patch.currency {
        invoice.currency = v;
    }
    if let Some(v) = patch.status {
        invoice.status = v;
    }
    if let Some(v) = patch.period_start {
        invoice.period_start = Some(v);
    }
    if let Some(v) = patch.period_end {
        invoice.period_end = Some(v);
    }
    if let Some(v) = patch.paid_at {
        invoice.paid_at = Some(v);
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn claim_event(
        &self,
        ctx: &OrgContext,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let mut state = self.inner.lock().await;
        let key = (ctx.org_id, event.provider_event_id.clone());

        match state.events.get_mut(&key) {
            None => {
                state.events.insert(
                    key,
                    WebhookEventRecord {
                        id: Uuid::new_v4(),
                        org_id: ctx.org_id,
                        provider_event_id: event.provider_event_id,
                        event_type: event.event_type,
                        raw_payload: event.raw_payload,
                        status: WebhookEventStatus::Received,
                        received_at: event.received_at,
                        processed_at: None,
                        error_detail: None,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
            Some(existing) => {
                let stale = existing.status == WebhookEventStatus::Received
                    && event.received_at - existing.received_at > reclaim_after;
                if stale {
                    // Prior claim presumed crashed; this delivery takes over.
                    existing.received_at = event.received_at;
                    existing.error_detail = Some("recovered from stale claim".to_string());
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::Duplicate {
                        existing: Some(existing.status),
                    })
                }
            }
        }
    }

    async fn complete_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
        disposition: EventDisposition,
    ) -> BillingResult<()> {
        let mut state = self.inner.lock().await;
        let key = (ctx.org_id, provider_event_id.to_string());
        let record = state.events.get_mut(&key).ok_or_else(|| {
            BillingError::Database(format!(
                "webhook event {} not found for completion",
                provider_event_id
            ))
        })?;

        match disposition {
            EventDisposition::Processed { at } => {
                record.status = WebhookEventStatus::Processed;
                record.processed_at = Some(at);
                record.error_detail = None;
            }
            EventDisposition::Failed { error } => {
                record.status = WebhookEventStatus::Failed;
                record.error_detail = Some(error);
            }
        }
        Ok(())
    }

    async fn get_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let state = self.inner.lock().await;
        Ok(state
            .events
            .get(&(ctx.org_id, provider_event_id.to_string()))
            .cloned())
    }

    async fn failed_events(&self, ctx: &OrgContext) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.inner.lock().await;
        let mut failed: Vec<WebhookEventRecord> = state
            .events
            .values()
            .filter(|e| e.org_id == ctx.org_id && e.status == WebhookEventStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(failed)
    }

    async fn upsert_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Subscription> {
        let mut state = self.inner.lock().await;
        let key = (ctx.org_id, external_subscription_id.to_string());
        let now = OffsetDateTime::now_utc();

        let sub = state.subscriptions.entry(key).or_insert_with(|| Subscription {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            external_subscription_id: external_subscription_id.to_string(),
            external_customer_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            updated_at: now,
        });
        apply_subscription_patch(sub, patch);
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn get_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.inner.lock().await;
        Ok(state
            .subscriptions
            .get(&(ctx.org_id, external_subscription_id.to_string()))
            .cloned())
    }

    async fn recover_subscription_if_past_due(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<bool> {
        let mut state = self.inner.lock().await;
        let key = (ctx.org_id, external_subscription_id.to_string());
        match state.subscriptions.get_mut(&key) {
            Some(sub) if sub.status == SubscriptionStatus::PastDue => {
                sub.status = SubscriptionStatus::Active;
                sub.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
        patch: InvoicePatch,
    ) -> BillingResult<Invoice> {
        let mut state = self.inner.lock().await;
        let key = (ctx.org_id, external_invoice_id.to_string());

        let invoice = state.invoices.entry(key).or_insert_with(|| Invoice {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            external_invoice_id: external_invoice_id.to_string(),
            external_subscription_id: None,
            amount_cents: 0,
            currency: "usd".to_string(),
            status: InvoiceStatus::Open,
            period_start: None,
            period_end: None,
            paid_at: None,
        });
        apply_invoice_patch(invoice, patch);
        Ok(invoice.clone())
    }

    async fn get_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let state = self.inner.lock().await;
        Ok(state
            .invoices
            .get(&(ctx.org_id, external_invoice_id.to_string()))
            .cloned())
    }

    async fn insert_refund_request(
        &self,
        ctx: &OrgContext,
        request: RefundRequest,
    ) -> BillingResult<RefundInsert> {
        let mut state = self.inner.lock().await;

        let pending_exists = state.refunds.values().any(|r| {
            r.org_id == ctx.org_id
                && r.payment_reference == request.payment_reference
                && r.status == RefundStatus::Pending
        });
        if pending_exists {
            return Ok(RefundInsert::PendingExists);
        }

        state.refunds.insert(request.id, request.clone());
        Ok(RefundInsert::Inserted(request))
    }

    async fn get_refund_request(
        &self,
        ctx: &OrgContext,
        id: Uuid,
    ) -> BillingResult<Option<RefundRequest>> {
        let state = self.inner.lock().await;
        Ok(state
            .refunds
            .get(&id)
            .filter(|r| r.org_id == ctx.org_id)
            .cloned())
    }

    async fn transition_refund(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        expected: &[RefundStatus],
        change: RefundChange,
    ) -> BillingResult<Option<RefundRequest>> {
        let mut state = self.inner.lock().await;
        let Some(row) = state.refunds.get_mut(&id) else {
            return Ok(None);
        };
        if row.org_id != ctx.org_id || !expected.contains(&row.status) {
            return Ok(None);
        }

        match change {
            RefundChange::Approve { approved_by } => {
                row.status = RefundStatus::Approved;
                row.approved_by = Some(approved_by);
            }
            RefundChange::Reject {
                rejected_by,
                reason,
            } => {
                row.status = RefundStatus::Rejected;
                row.rejected_by = Some(rejected_by);
                row.rejection_reason = Some(reason);
            }
            RefundChange::Cancel => {
                row.status = RefundStatus::Cancelled;
            }
            RefundChange::BeginProcess { started_at } => {
                row.status = RefundStatus::Processing;
                row.processing_started_at = Some(started_at);
            }
            RefundChange::Process {
                linked_refund_id,
                processed_at,
            } => {
                row.status = RefundStatus::Processed;
                row.processing_started_at = None;
                row.linked_refund_id = Some(linked_refund_id);
                row.processed_at = Some(processed_at);
            }
            RefundChange::AbortProcess => {
                row.status = RefundStatus::Approved;
                row.processing_started_at = None;
            }
            RefundChange::Escalate { escalated_to } => {
                row.escalated = true;
                row.escalated_to = Some(escalated_to);
            }
        }
        Ok(Some(row.clone()))
    }

    async fn overdue_refund_requests(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<RefundRequest>> {
        let state = self.inner.lock().await;
        let mut overdue: Vec<RefundRequest> = state
            .refunds
            .values()
            .filter(|r| {
                r.org_id == ctx.org_id && r.status == RefundStatus::Pending && r.due_by < now
            })
            .cloned()
            .collect();
        overdue.sort_by(|a, b| a.due_by.cmp(&b.due_by));
        Ok(overdue)
    }

    async fn refund_requests_with_status(
        &self,
        ctx: &OrgContext,
        statuses: &[RefundStatus],
    ) -> BillingResult<Vec<RefundRequest>> {
        let state = self.inner.lock().await;
        let mut rows: Vec<RefundRequest> = state
            .refunds
            .values()
            .filter(|r| r.org_id == ctx.org_id && statuses.contains(&r.status))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn append_audit(&self, ctx: &OrgContext, entry: RefundAuditEntry) -> BillingResult<()> {
        debug_assert_eq!(entry.org_id, ctx.org_id);
        self.inner.lock().await.audit.push(entry);
        Ok(())
    }

    async fn audit_trail(
        &self,
        ctx: &OrgContext,
        refund_request_id: Uuid,
    ) -> BillingResult<Vec<RefundAuditEntry>> {
        let state = self.inner.lock().await;
        // Vec order is insertion order, which is creation order.
        Ok(state
            .audit
            .iter()
            .filter(|e| e.org_id == ctx.org_id && e.refund_request_id == refund_request_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> OrgContext {
        OrgContext::new(Uuid::new_v4())
    }

    fn new_event(id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            provider_event_id: id.to_string(),
            event_type: "invoice.paid".to_string(),
            raw_payload: json!({"id": id}),
            received_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn second_claim_is_duplicate() {
        let store = MemoryStore::new();
        let ctx = ctx();

        let first = store
            .claim_event(&ctx, new_event("evt_1"), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(first, ClaimOutcome::Claimed);

        let second = store
            .claim_event(&ctx, new_event("evt_1"), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(
            second,
            ClaimOutcome::Duplicate {
                existing: Some(WebhookEventStatus::Received)
            }
        );
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn same_event_id_in_another_org_is_a_distinct_row() {
        let store = MemoryStore::new();
        let a = ctx();
        let b = ctx();

        for c in [&a, &b] {
            let outcome = store
                .claim_event(c, new_event("evt_1"), Duration::minutes(30))
                .await
                .unwrap();
            assert_eq!(outcome, ClaimOutcome::Claimed);
        }
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn stale_received_claim_is_recovered() {
        let store = MemoryStore::new();
        let ctx = ctx();

        let mut old = new_event("evt_stuck");
        old.received_at = OffsetDateTime::now_utc() - Duration::minutes(45);
        assert_eq!(
            store
                .claim_event(&ctx, old, Duration::minutes(30))
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );

        // Redelivery 45 minutes later: prior claim never completed.
        let outcome = store
            .claim_event(&ctx, new_event("evt_stuck"), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);

        let record = store.get_event(&ctx, "evt_stuck").await.unwrap().unwrap();
        assert_eq!(record.status, WebhookEventStatus::Received);
        assert_eq!(
            record.error_detail.as_deref(),
            Some("recovered from stale claim")
        );
    }

    #[tokio::test]
    async fn processed_rows_are_never_reclaimed() {
        let store = MemoryStore::new();
        let ctx = ctx();

        let mut old = new_event("evt_done");
        old.received_at = OffsetDateTime::now_utc() - Duration::hours(2);
        store
            .claim_event(&ctx, old, Duration::minutes(30))
            .await
            .unwrap();
        store
            .complete_event(
                &ctx,
                "evt_done",
                EventDisposition::Processed {
                    at: OffsetDateTime::now_utc(),
                },
            )
            .await
            .unwrap();

        let outcome = store
            .claim_event(&ctx, new_event("evt_done"), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Duplicate {
                existing: Some(WebhookEventStatus::Processed)
            }
        );
    }

    #[tokio::test]
    async fn failed_disposition_keeps_error_detail() {
        let store = MemoryStore::new();
        let ctx = ctx();

        store
            .claim_event(&ctx, new_event("evt_bad"), Duration::minutes(30))
            .await
            .unwrap();
        store
            .complete_event(
                &ctx,
                "evt_bad",
                EventDisposition::Failed {
                    error: "subscription missing".to_string(),
                },
            )
            .await
            .unwrap();

        let failed = store.failed_events(&ctx).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].error_detail.as_deref(),
            Some("subscription missing")
        );
    }

    #[tokio::test]
    async fn subscription_patch_only_overwrites_present_fields() {
        let store = MemoryStore::new();
        let ctx = ctx();

        store
            .upsert_subscription(
                &ctx,
                "sub_1",
                SubscriptionPatch {
                    external_customer_id: Some("cus_1".to_string()),
                    status: Some(SubscriptionStatus::Trial),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let updated = store
            .upsert_subscription(
                &ctx,
                "sub_1",
                SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, SubscriptionStatus::Active);
        // Field absent from the second patch kept its value.
        assert_eq!(updated.external_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn pending_duplicate_is_rejected_terminal_is_not() {
        let store = MemoryStore::new();
        let ctx = ctx();
        let request = crate::refunds::test_request(&ctx, "ch_1", 10_000, 5_000);

        assert!(matches!(
            store.insert_refund_request(&ctx, request.clone()).await.unwrap(),
            RefundInsert::Inserted(_)
        ));

        let mut second = crate::refunds::test_request(&ctx, "ch_1", 10_000, 2_000);
        assert!(matches!(
            store.insert_refund_request(&ctx, second.clone()).await.unwrap(),
            RefundInsert::PendingExists
        ));

        // Once the first request is terminal, a new one may be filed.
        store
            .transition_refund(
                &ctx,
                request.id,
                &[RefundStatus::Pending],
                RefundChange::Reject {
                    rejected_by: Uuid::new_v4(),
                    reason: "not eligible".to_string(),
                },
            )
            .await
            .unwrap()
            .unwrap();

        second.id = Uuid::new_v4();
        assert!(matches!(
            store.insert_refund_request(&ctx, second).await.unwrap(),
            RefundInsert::Inserted(_)
        ));
    }

    #[tokio::test]
    async fn transition_guard_rejects_unexpected_status() {
        let store = MemoryStore::new();
        let ctx = ctx();
        let request = crate::refunds::test_request(&ctx, "ch_2", 10_000, 5_000);
        store.insert_refund_request(&ctx, request.clone()).await.unwrap();

        let approved = store
            .transition_refund(
                &ctx,
                request.id,
                &[RefundStatus::Pending],
                RefundChange::Approve {
                    approved_by: Uuid::new_v4(),
                },
            )
            .await
            .unwrap();
        assert!(approved.is_some());

        // Second approve: status is no longer Pending.
        let again = store
            .transition_refund(
                &ctx,
                request.id,
                &[RefundStatus::Pending],
                RefundChange::Approve {
                    approved_by: Uuid::new_v4(),
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn refund_rows_are_invisible_across_orgs() {
        let store = MemoryStore::new();
        let a = ctx();
        let b = ctx();
        let request = crate::refunds::test_request(&a, "ch_3", 10_000, 5_000);
        store.insert_refund_request(&a, request.clone()).await.unwrap();

        assert!(store.get_refund_request(&b, request.id).await.unwrap().is_none());
        let denied = store
            .transition_refund(&b, request.id, &[RefundStatus::Pending], RefundChange::Cancel)
            .await
            .unwrap();
        assert!(denied.is_none());
    }
}
