// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Webhook ingestion (BILL-W01 to BILL-W05)
//! - Refund workflow races (BILL-RF01 to BILL-RF05)
//! - End-to-end lifecycles (BILL-E01 to BILL-E03)

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::audit::RefundAuditEntry;
use crate::client::{GatewayRefund, MockGateway, PaymentGateway};
use crate::context::OrgContext;
use crate::error::{BillingError, BillingResult};
use crate::invariants::RefundReconciler;
use crate::notify::RecordingNotifier;
use crate::reconciliation::{Invoice, Subscription};
use crate::refunds::{NewRefundRequest, RefundPolicy, RefundRequest, RefundStatus};
use crate::store::memory::MemoryStore;
use crate::store::{
    BillingStore, ClaimOutcome, EventDisposition, InvoicePatch, NewWebhookEvent, RefundChange,
    RefundInsert, SubscriptionPatch,
};
use crate::webhooks::{WebhookEventRecord, WebhookEventStatus};
use crate::{BillingService, GatewayEvent, IngestOutcome, RefundActor};

const SECRET: &str = "whsec_edge_case_secret";

struct Fixture {
    service: Arc<BillingService>,
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    notifier: Arc<RecordingNotifier>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let service = Arc::new(BillingService::with_components(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        SECRET.to_string(),
        RefundPolicy::default(),
    ));
    Fixture {
        service,
        store,
        gateway,
        notifier,
    }
}

fn paid_event(event_id: &str, invoice_id: &str, subscription: &str) -> GatewayEvent {
    let body = serde_json::json!({
        "id": event_id,
        "type": "invoice.paid",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": {
            "id": invoice_id,
            "subscription": subscription,
            "customer": "cus_edge",
            "amount_paid": 9900,
            "currency": "usd"
        }}
    });
    GatewayEvent::from_json(&body.to_string()).unwrap()
}

fn payment_failed_event(event_id: &str, invoice_id: &str, subscription: &str) -> GatewayEvent {
    let body = serde_json::json!({
        "id": event_id,
        "type": "invoice.payment_failed",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": {
            "id": invoice_id,
            "subscription": subscription,
            "customer": "cus_edge",
            "amount_due": 9900,
            "currency": "usd",
            "failure_message": "card_declined"
        }}
    });
    GatewayEvent::from_json(&body.to_string()).unwrap()
}

/// Wraps `MemoryStore` and fails invoice upserts on demand, to drive a
/// webhook handler into its failure path.
struct FailingStore {
    inner: MemoryStore,
    fail_invoice_upserts: AtomicBool,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_invoice_upserts: AtomicBool::new(false),
        }
    }

    fn fail_invoice_upserts(&self, fail: bool) {
        self.fail_invoice_upserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingStore for FailingStore {
    async fn claim_event(
        &self,
        ctx: &OrgContext,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        self.inner.claim_event(ctx, event, reclaim_after).await
    }

    async fn complete_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
        disposition: EventDisposition,
    ) -> BillingResult<()> {
        self.inner
            .complete_event(ctx, provider_event_id, disposition)
            .await
    }

    async fn get_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        self.inner.get_event(ctx, provider_event_id).await
    }

    async fn failed_events(&self, ctx: &OrgContext) -> BillingResult<Vec<WebhookEventRecord>> {
        self.inner.failed_events(ctx).await
    }

    async fn upsert_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Subscription> {
        self.inner
            .upsert_subscription(ctx, external_subscription_id, patch)
            .await
    }

    async fn get_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.inner
            .get_subscription(ctx, external_subscription_id)
            .await
    }

    async fn recover_subscription_if_past_due(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<bool> {
        self.inner
            .recover_subscription_if_past_due(ctx, external_subscription_id)
            .await
    }

    async fn upsert_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
        patch: InvoicePatch,
    ) -> BillingResult<Invoice> {
        if self.fail_invoice_upserts.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "injected invoice upsert failure".to_string(),
            ));
        }
        self.inner
            .upsert_invoice(ctx, external_invoice_id, patch)
            .await
    }

    async fn get_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        self.inner.get_invoice(ctx, external_invoice_id).await
    }

    async fn insert_refund_request(
        &self,
        ctx: &OrgContext,
        request: RefundRequest,
    ) -> BillingResult<RefundInsert> {
        self.inner.insert_refund_request(ctx, request).await
    }

    async fn get_refund_request(
        &self,
        ctx: &OrgContext,
        id: Uuid,
    ) -> BillingResult<Option<RefundRequest>> {
        self.inner.get_refund_request(ctx, id).await
    }

    async fn transition_refund(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        expected: &[RefundStatus],
        change: RefundChange,
    ) -> BillingResult<Option<RefundRequest>> {
        self.inner.transition_refund(ctx, id, expected, change).await
    }

    async fn overdue_refund_requests(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<RefundRequest>> {
        self.inner.overdue_refund_requests(ctx, now).await
    }

    async fn refund_requests_with_status(
        &self,
        ctx: &OrgContext,
        statuses: &[RefundStatus],
    ) -> BillingResult<Vec<RefundRequest>> {
        self.inner.refund_requests_with_status(ctx, statuses).await
    }

    async fn append_audit(&self, ctx: &OrgContext, entry: RefundAuditEntry) -> BillingResult<()> {
        self.inner.append_audit(ctx, entry).await
    }

    async fn audit_trail(
        &self,
        ctx: &OrgContext,
        refund_request_id: Uuid,
    ) -> BillingResult<Vec<RefundAuditEntry>> {
        self.inner.audit_trail(ctx, refund_request_id).await
    }
}

/// Wraps `MockGateway` and holds each `create_refund` call open until the
/// test releases it, so a test can pin one `process()` call inside its
/// gateway window.
struct GatedGateway {
    inner: Arc<MockGateway>,
    entered: Notify,
    release: Notify,
}

impl GatedGateway {
    fn new(inner: Arc<MockGateway>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl PaymentGateway for GatedGateway {
    async fn create_refund(
        &self,
        payment_reference: &str,
        amount_cents: i64,
        reason: Option<&str>,
    ) -> BillingResult<GatewayRefund> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner
            .create_refund(payment_reference, amount_cents, reason)
            .await
    }

    async fn list_refunds(&self, payment_reference: &str) -> BillingResult<Vec<GatewayRefund>> {
        self.inner.list_refunds(payment_reference).await
    }
}

#[cfg(test)]
mod webhook_ingestion_tests {
    use super::*;
    use tokio::sync::Barrier;

    // =========================================================================
    // BILL-W01: 8 parallel deliveries of one event - exactly one processes
    // =========================================================================
    #[tokio::test]
    async fn concurrent_deliveries_process_exactly_once() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = vec![];
        for _ in 0..8 {
            let service = f.service.clone();
            let barrier = barrier.clone();
            let event = paid_event("evt_race", "in_race", "sub_race");
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.ingestor.ingest(&ctx, event).await.unwrap()
            }));
        }

        let mut processed = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                IngestOutcome::Processed => processed += 1,
                IngestOutcome::Duplicate => duplicates += 1,
                IngestOutcome::Failed { error } => panic!("unexpected failure: {}", error),
            }
        }

        assert_eq!(processed, 1, "exactly one delivery should process");
        assert_eq!(duplicates, 7, "the rest should be duplicates");
        assert_eq!(f.store.event_count().await, 1);
        assert_eq!(f.notifier.payment_succeeded_count().await, 1);
    }

    // =========================================================================
    // BILL-W02: same provider event id in two orgs - both process
    // =========================================================================
    #[tokio::test]
    async fn same_event_id_is_separate_per_org() {
        let f = fixture();
        let org_a = OrgContext::new(Uuid::new_v4());
        let org_b = OrgContext::new(Uuid::new_v4());

        let first = f
            .service
            .ingestor
            .ingest(&org_a, paid_event("evt_shared", "in_a", "sub_a"))
            .await
            .unwrap();
        let second = f
            .service
            .ingestor
            .ingest(&org_b, paid_event("evt_shared", "in_b", "sub_b"))
            .await
            .unwrap();

        assert_eq!(first, IngestOutcome::Processed);
        assert_eq!(second, IngestOutcome::Processed);
        assert_eq!(f.store.event_count().await, 2);
        assert_eq!(f.notifier.payment_succeeded_count().await, 2);
    }

    // =========================================================================
    // BILL-W03: handler failure - recorded FAILED, sender still acknowledged
    // =========================================================================
    #[tokio::test]
    async fn handler_failure_is_recorded_not_raised() {
        let store = Arc::new(FailingStore::new());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = BillingService::with_components(
            store.clone(),
            gateway,
            notifier.clone(),
            SECRET.to_string(),
            RefundPolicy::default(),
        );
        let ctx = OrgContext::new(Uuid::new_v4());

        store.fail_invoice_upserts(true);
        let outcome = service
            .ingestor
            .ingest(&ctx, paid_event("evt_fail", "in_fail", "sub_fail"))
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Failed { error } => {
                assert!(error.contains("injected invoice upsert failure"));
            }
            other => panic!("expected failed outcome, got {:?}", other),
        }

        let record = store.get_event(&ctx, "evt_fail").await.unwrap().unwrap();
        assert_eq!(record.status, WebhookEventStatus::Failed);
        assert!(record
            .error_detail
            .as_deref()
            .unwrap()
            .contains("injected invoice upsert failure"));
        assert_eq!(notifier.total().await, 0);
    }

    // =========================================================================
    // BILL-W04: failed events surface in the operator listing
    // =========================================================================
    #[tokio::test]
    async fn failed_events_are_listed_for_operators() {
        let store = Arc::new(FailingStore::new());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = BillingService::with_components(
            store.clone(),
            gateway,
            notifier,
            SECRET.to_string(),
            RefundPolicy::default(),
        );
        let ctx = OrgContext::new(Uuid::new_v4());

        store.fail_invoice_upserts(true);
        service
            .ingestor
            .ingest(&ctx, paid_event("evt_fail_1", "in_1", "sub_1"))
            .await
            .unwrap();
        store.fail_invoice_upserts(false);
        service
            .ingestor
            .ingest(&ctx, paid_event("evt_ok", "in_2", "sub_2"))
            .await
            .unwrap();

        let failed = service.ingestor.failed_events(&ctx).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].provider_event_id, "evt_fail_1");
    }

    // =========================================================================
    // BILL-W05: redelivery of a failed event is a duplicate, not a retry
    // =========================================================================
    #[tokio::test]
    async fn failed_event_redelivery_is_not_reprocessed() {
        let store = Arc::new(FailingStore::new());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = BillingService::with_components(
            store.clone(),
            gateway,
            notifier.clone(),
            SECRET.to_string(),
            RefundPolicy::default(),
        );
        let ctx = OrgContext::new(Uuid::new_v4());

        store.fail_invoice_upserts(true);
        service
            .ingestor
            .ingest(&ctx, paid_event("evt_fail", "in_1", "sub_1"))
            .await
            .unwrap();

        // The bug is "fixed" but the redelivery must not re-run the handler;
        // replay is an explicit operator action, not a webhook retry.
        store.fail_invoice_upserts(false);
        let outcome = service
            .ingestor
            .ingest(&ctx, paid_event("evt_fail", "in_1", "sub_1"))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Duplicate);
        let record = store.get_event(&ctx, "evt_fail").await.unwrap().unwrap();
        assert_eq!(record.status, WebhookEventStatus::Failed);
        assert_eq!(notifier.total().await, 0);
    }
}

#[cfg(test)]
mod refund_race_tests {
    use super::*;
    use tokio::sync::Barrier;

    fn refund_of(amount_cents: i64) -> NewRefundRequest {
        NewRefundRequest {
            payment_reference: "ch_race".to_string(),
            original_amount_cents: 10_000,
            requested_amount_cents: amount_cents,
            currency: "usd".to_string(),
            reason: Some("customer request".to_string()),
        }
    }

    // =========================================================================
    // BILL-RF01: two concurrent approves - exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn concurrent_approves_have_one_winner() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());
        let row = f
            .service
            .refunds
            .create(&ctx, RefundActor::user(Uuid::new_v4()), refund_of(5_000))
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let service = f.service.clone();
            let barrier = barrier.clone();
            let id = row.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .refunds
                    .approve(&ctx, id, RefundActor::admin(Uuid::new_v4()), None)
                    .await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(updated) => {
                    assert_eq!(updated.status, RefundStatus::Approved);
                    wins += 1;
                }
                Err(BillingError::InvalidStateTransition { current, action }) => {
                    assert_eq!(current, RefundStatus::Approved);
                    assert_eq!(action, "approve");
                    losses += 1;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(losses, 1);

        // One CREATED and exactly one APPROVED entry.
        let trail = f.service.refunds.audit_trail(&ctx, row.id).await.unwrap();
        assert_eq!(trail.len(), 2);
    }

    // =========================================================================
    // BILL-RF02: concurrent approve and reject - one outcome, never both
    // =========================================================================
    #[tokio::test]
    async fn concurrent_approve_and_reject_are_exclusive() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());
        let row = f
            .service
            .refunds
            .create(&ctx, RefundActor::user(Uuid::new_v4()), refund_of(5_000))
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let approve = {
            let service = f.service.clone();
            let barrier = barrier.clone();
            let id = row.id;
            tokio::spawn(async move {
                barrier.wait().await;
                service
                    .refunds
                    .approve(&ctx, id, RefundActor::admin(Uuid::new_v4()), None)
                    .await
            })
        };
        let reject = {
            let service = f.service.clone();
            let barrier = barrier.clone();
            let id = row.id;
            tokio::spawn(async move {
                barrier.wait().await;
                service
                    .refunds
                    .reject(
                        &ctx,
                        id,
                        RefundActor::admin(Uuid::new_v4()),
                        "declined".to_string(),
                        None,
                    )
                    .await
            })
        };

        let outcomes = [approve.await.unwrap(), reject.await.unwrap()];
        let wins = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(wins, 1, "exactly one of approve/reject may win");

        let current = f.service.refunds.get(&ctx, row.id).await.unwrap();
        assert!(
            current.status == RefundStatus::Approved || current.status == RefundStatus::Rejected
        );
    }

    // =========================================================================
    // BILL-RF03: concurrent process calls - one processed row, one link
    // =========================================================================
    #[tokio::test]
    async fn concurrent_process_commits_exactly_one_link() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());
        let admin = RefundActor::admin(Uuid::new_v4());
        let row = f
            .service
            .refunds
            .create(&ctx, RefundActor::user(Uuid::new_v4()), refund_of(5_000))
            .await
            .unwrap();
        f.service.refunds.approve(&ctx, row.id, admin, None).await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let service = f.service.clone();
            let barrier = barrier.clone();
            let id = row.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .refunds
                    .process(&ctx, id, RefundActor::admin(Uuid::new_v4()))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(updated) => {
                    assert_eq!(updated.status, RefundStatus::Processed);
                    wins += 1;
                }
                Err(BillingError::InvalidStateTransition { action: "process", .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(wins, 1, "exactly one process call may commit");

        let current = f.service.refunds.get(&ctx, row.id).await.unwrap();
        assert_eq!(current.status, RefundStatus::Processed);
        assert!(current.linked_refund_id.is_some());

        // The processing claim is taken before the gateway call, so the
        // loser never reaches the gateway.
        assert_eq!(f.gateway.call_count("create_refund").await, 1);
        assert_eq!(f.gateway.list_refunds("ch_race").await.unwrap().len(), 1);
    }

    // =========================================================================
    // BILL-RF04: concurrent creates for one payment - one pending row
    // =========================================================================
    #[tokio::test]
    async fn concurrent_creates_leave_one_pending_row() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let service = f.service.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .refunds
                    .create(&ctx, RefundActor::user(Uuid::new_v4()), refund_of(5_000))
                    .await
            }));
        }

        let mut wins = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(BillingError::DuplicatePendingRequest { .. }) => duplicates += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(duplicates, 1);
        assert_eq!(f.store.refund_count().await, 1);
    }

    // =========================================================================
    // BILL-RF05: one caller held inside the gateway call - the other is
    // refused before the gateway, and exactly one refund exists after
    // =========================================================================
    #[tokio::test]
    async fn caller_held_at_the_gateway_locks_out_the_second() {
        let store = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockGateway::new());
        let gateway = Arc::new(GatedGateway::new(mock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let service = Arc::new(BillingService::with_components(
            store.clone(),
            gateway.clone(),
            notifier,
            SECRET.to_string(),
            RefundPolicy::default(),
        ));
        let ctx = OrgContext::new(Uuid::new_v4());
        let admin = RefundActor::admin(Uuid::new_v4());

        let row = service
            .refunds
            .create(&ctx, RefundActor::user(Uuid::new_v4()), refund_of(5_000))
            .await
            .unwrap();
        service.refunds.approve(&ctx, row.id, admin, None).await.unwrap();
        mock.succeed_with("re_only").await;

        // The first caller claims the row and is held at the gateway.
        let first = {
            let service = service.clone();
            let id = row.id;
            tokio::spawn(async move {
                service
                    .refunds
                    .process(&ctx, id, RefundActor::admin(Uuid::new_v4()))
                    .await
            })
        };
        gateway.entered.notified().await;

        // The second caller arrives mid-disbursal: refused on the claim,
        // before its own gateway call.
        let err = service.refunds.process(&ctx, row.id, admin).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidStateTransition {
                current: RefundStatus::Processing,
                action: "process",
            }
        ));

        gateway.release.notify_one();
        let processed = first.await.unwrap().unwrap();
        assert_eq!(processed.status, RefundStatus::Processed);
        assert_eq!(processed.linked_refund_id.as_deref(), Some("re_only"));

        assert_eq!(mock.call_count("create_refund").await, 1);
        assert_eq!(mock.list_refunds("ch_race").await.unwrap().len(), 1);

        // And the books balance afterwards.
        let reconciler = RefundReconciler::new(store, gateway);
        let summary = reconciler
            .check(&ctx, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use crate::audit::RefundAuditAction;

    // =========================================================================
    // BILL-E01: partial refund lifecycle - request, approve, process, audit
    // =========================================================================
    #[tokio::test]
    async fn partial_refund_lifecycle_end_to_end() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());
        let requester = RefundActor::user(Uuid::new_v4());
        let admin = RefundActor::admin(Uuid::new_v4());

        // $50 back out of a $100 charge.
        let row = f
            .service
            .refunds
            .create(
                &ctx,
                requester,
                NewRefundRequest {
                    payment_reference: "ch_100usd".to_string(),
                    original_amount_cents: 10_000,
                    requested_amount_cents: 5_000,
                    currency: "usd".to_string(),
                    reason: Some("half order returned".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(row.status, RefundStatus::Pending);

        let approved = f
            .service
            .refunds
            .approve(&ctx, row.id, admin, None)
            .await
            .unwrap();
        assert_eq!(approved.status, RefundStatus::Approved);
        assert_eq!(approved.approved_by, Some(admin.id));

        f.gateway.succeed_with("re_123").await;
        let processed = f.service.refunds.process(&ctx, row.id, admin).await.unwrap();
        assert_eq!(processed.status, RefundStatus::Processed);
        assert_eq!(processed.linked_refund_id.as_deref(), Some("re_123"));

        assert_eq!(
            f.gateway.last_refund().await,
            Some((
                "ch_100usd".to_string(),
                5_000,
                Some("half order returned".to_string())
            ))
        );

        let trail = f.service.refunds.audit_trail(&ctx, row.id).await.unwrap();
        let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                RefundAuditAction::Created,
                RefundAuditAction::Approved,
                RefundAuditAction::Processed,
            ]
        );
    }

    // =========================================================================
    // BILL-E02: payment_failed delivered twice - one transition, one email
    // =========================================================================
    #[tokio::test]
    async fn duplicate_payment_failure_notifies_once() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());

        let first = f
            .service
            .ingestor
            .ingest(&ctx, payment_failed_event("evt_pf", "in_pf", "sub_pf"))
            .await
            .unwrap();
        let second = f
            .service
            .ingestor
            .ingest(&ctx, payment_failed_event("evt_pf", "in_pf", "sub_pf"))
            .await
            .unwrap();

        assert_eq!(first, IngestOutcome::Processed);
        assert_eq!(second, IngestOutcome::Duplicate);

        let sub = f.store.get_subscription(&ctx, "sub_pf").await.unwrap().unwrap();
        assert_eq!(
            sub.status,
            crate::reconciliation::SubscriptionStatus::PastDue
        );
        assert_eq!(f.notifier.payment_failed_count().await, 1);
        assert_eq!(f.store.event_count().await, 1);
    }

    // =========================================================================
    // BILL-E03: dunning recovery - failure then payment reactivates
    // =========================================================================
    #[tokio::test]
    async fn failed_then_paid_recovers_subscription() {
        let f = fixture();
        let ctx = OrgContext::new(Uuid::new_v4());

        f.service
            .ingestor
            .ingest(&ctx, payment_failed_event("evt_1", "in_1", "sub_dun"))
            .await
            .unwrap();
        let sub = f.store.get_subscription(&ctx, "sub_dun").await.unwrap().unwrap();
        assert_eq!(
            sub.status,
            crate::reconciliation::SubscriptionStatus::PastDue
        );

        f.service
            .ingestor
            .ingest(&ctx, paid_event("evt_2", "in_1", "sub_dun"))
            .await
            .unwrap();
        let sub = f.store.get_subscription(&ctx, "sub_dun").await.unwrap().unwrap();
        assert_eq!(sub.status, crate::reconciliation::SubscriptionStatus::Active);

        assert_eq!(f.notifier.payment_failed_count().await, 1);
        assert_eq!(f.notifier.payment_succeeded_count().await, 1);
    }
}
