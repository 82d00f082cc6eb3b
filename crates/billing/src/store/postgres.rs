//! Postgres `BillingStore`
//!
//! Single-statement writes throughout: the claim is an
//! INSERT..ON CONFLICT..RETURNING, upserts fold patches with COALESCE so
//! absent fields keep their stored values, and refund transitions are
//! guarded UPDATEs. No multi-statement transactions are needed.

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{ActorType, RefundAuditAction, RefundAuditEntry};
use crate::context::OrgContext;
use crate::error::{BillingError, BillingResult};
use crate::reconciliation::{Invoice, InvoiceStatus, Subscription, SubscriptionStatus};
use crate::refunds::{RefundRequest, RefundStatus};
use crate::webhooks::{WebhookEventRecord, WebhookEventStatus};

use super::{
    BillingStore, ClaimOutcome, EventDisposition, InvoicePatch, NewWebhookEvent, RefundChange,
    RefundInsert, SubscriptionPatch,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(context: &str, e: sqlx::Error) -> BillingError {
    BillingError::Database(format!("{}: {}", context, e))
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    org_id: Uuid,
    provider_event_id: String,
    event_type: String,
    raw_payload: serde_json::Value,
    status: String,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    error_detail: Option<String>,
}

impl WebhookEventRow {
    fn into_record(self) -> BillingResult<WebhookEventRecord> {
        let status = WebhookEventStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("unknown webhook event status: {}", self.status))
        })?;
        Ok(WebhookEventRecord {
            id: self.id,
            org_id: self.org_id,
            provider_event_id: self.provider_event_id,
            event_type: self.event_type,
            raw_payload: self.raw_payload,
            status,
            received_at: self.received_at,
            processed_at: self.processed_at,
            error_detail: self.error_detail,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    org_id: Uuid,
    external_subscription_id: String,
    external_customer_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    cancelled_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_record(self) -> BillingResult<Subscription> {
        let status = SubscriptionStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("unknown subscription status: {}", self.status))
        })?;
        Ok(Subscription {
            id: self.id,
            org_id: self.org_id,
            external_subscription_id: self.external_subscription_id,
            external_customer_id: self.external_customer_id,
            status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            cancel_at_period_end: self.cancel_at_period_end,
            cancelled_at: self.cancelled_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    org_id: Uuid,
    external_invoice_id: String,
    external_subscription_id: Option<String>,
    amount_cents: i64,
    currency: String,
    status: String,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
}

impl InvoiceRow {
    fn into_record(self) -> BillingResult<Invoice> {
        let status = InvoiceStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("unknown invoice status: {}", self.status))
        })?;
        Ok(Invoice {
            id: self.id,
            org_id: self.org_id,
            external_invoice_id: self.external_invoice_id,
            external_subscription_id: self.external_subscription_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            status,
            period_start: self.period_start,
            period_end: self.period_end,
            paid_at: self.paid_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundRequestRow {
    id: Uuid,
    org_id: Uuid,
    payment_reference: String,
    original_amount_cents: i64,
    requested_amount_cents: i64,
    currency: String,
    reason: Option<String>,
    status: String,
    requested_by: Uuid,
    approved_by: Option<Uuid>,
    rejected_by: Option<Uuid>,
    rejection_reason: Option<String>,
    escalated: bool,
    escalated_to: Option<String>,
    due_by: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    linked_refund_id: Option<String>,
    created_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl RefundRequestRow {
    fn into_record(self) -> BillingResult<RefundRequest> {
        let status = RefundStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("unknown refund status: {}", self.status))
        })?;
        Ok(RefundRequest {
            id: self.id,
            org_id: self.org_id,
            payment_reference: self.payment_reference,
            original_amount_cents: self.original_amount_cents,
            requested_amount_cents: self.requested_amount_cents,
            currency: self.currency,
            reason: self.reason,
            status,
            requested_by: self.requested_by,
            approved_by: self.approved_by,
            rejected_by: self.rejected_by,
            rejection_reason: self.rejection_reason,
            escalated: self.escalated,
            escalated_to: self.escalated_to,
            due_by: self.due_by,
            processing_started_at: self.processing_started_at,
            linked_refund_id: self.linked_refund_id,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    org_id: Uuid,
    refund_request_id: Uuid,
    actor_id: Uuid,
    actor_type: String,
    action: String,
    notes: Option<String>,
    created_at: OffsetDateTime,
}

impl AuditRow {
    fn into_record(self) -> BillingResult<RefundAuditEntry> {
        let actor_type = ActorType::parse(&self.actor_type).ok_or_else(|| {
            BillingError::Database(format!("unknown audit actor type: {}", self.actor_type))
        })?;
        let action = RefundAuditAction::parse(&self.action).ok_or_else(|| {
            BillingError::Database(format!("unknown audit action: {}", self.action))
        })?;
        Ok(RefundAuditEntry {
            id: self.id,
            org_id: self.org_id,
            refund_request_id: self.refund_request_id,
            actor_id: self.actor_id,
            actor_type,
            action,
            notes: self.notes,
            created_at: self.created_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, org_id, provider_event_id, event_type, raw_payload, status, \
                             received_at, processed_at, error_detail";

const SUBSCRIPTION_COLUMNS: &str =
    "id, org_id, external_subscription_id, external_customer_id, status, current_period_start, \
     current_period_end, trial_start, trial_end, cancel_at_period_end, cancelled_at, updated_at";

const INVOICE_COLUMNS: &str =
    "id, org_id, external_invoice_id, external_subscription_id, amount_cents, currency, status, \
     period_start, period_end, paid_at";

const REFUND_COLUMNS: &str =
    "id, org_id, payment_reference, original_amount_cents, requested_amount_cents, currency, \
     reason, status, requested_by, approved_by, rejected_by, rejection_reason, escalated, \
     escalated_to, due_by, processing_started_at, linked_refund_id, created_at, processed_at";

#[async_trait]
impl BillingStore for PgStore {
    async fn claim_event(
        &self,
        ctx: &OrgContext,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let reclaim_minutes = reclaim_after.whole_minutes() as i32;

        // Only ONE concurrent delivery gets a row back: the fresh insert,
        // or the one that takes over a claim stuck past the timeout. The
        // conflict UPDATE refreshes received_at so later redeliveries see
        // a fresh claim again.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (id, org_id, provider_event_id, event_type, raw_payload, status, received_at)
            VALUES ($1, $2, $3, $4, $5, 'received', $6)
            ON CONFLICT (org_id, provider_event_id) DO UPDATE SET
                received_at = $6,
                error_detail = 'recovered from stale claim'
            WHERE gateway_webhook_events.status = 'received'
              AND gateway_webhook_events.received_at < $6 - ($7 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ctx.org_id)
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.raw_payload)
        .bind(event.received_at)
        .bind(reclaim_minutes)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                org_id = %ctx.org_id,
                event_id = %event.provider_event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            db_err("claim webhook event", e)
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        // Diagnostics only; the duplicate decision is already made.
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM gateway_webhook_events WHERE org_id = $1 AND provider_event_id = $2",
        )
        .bind(ctx.org_id)
        .bind(&event.provider_event_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        Ok(ClaimOutcome::Duplicate {
            existing: existing.and_then(|(s,)| WebhookEventStatus::parse(&s)),
        })
    }

    async fn complete_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
        disposition: EventDisposition,
    ) -> BillingResult<()> {
        let result = match disposition {
            EventDisposition::Processed { at } => {
                sqlx::query(
                    r#"
                    UPDATE gateway_webhook_events
                    SET status = 'processed', processed_at = $3, error_detail = NULL
                    WHERE org_id = $1 AND provider_event_id = $2
                    "#,
                )
                .bind(ctx.org_id)
                .bind(provider_event_id)
                .bind(at)
                .execute(&self.pool)
                .await
            }
            EventDisposition::Failed { error } => {
                sqlx::query(
                    r#"
                    UPDATE gateway_webhook_events
                    SET status = 'failed', error_detail = $3
                    WHERE org_id = $1 AND provider_event_id = $2
                    "#,
                )
                .bind(ctx.org_id)
                .bind(provider_event_id)
                .bind(error)
                .execute(&self.pool)
                .await
            }
        };

        let result = result.map_err(|e| db_err("record webhook outcome", e))?;
        if result.rows_affected() == 0 {
            return Err(BillingError::Database(format!(
                "webhook event {} not found for completion",
                provider_event_id
            )));
        }
        Ok(())
    }

    async fn get_event(
        &self,
        ctx: &OrgContext,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM gateway_webhook_events WHERE org_id = $1 AND provider_event_id = $2",
            EVENT_COLUMNS
        ))
        .bind(ctx.org_id)
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load webhook event", e))?;

        row.map(WebhookEventRow::into_record).transpose()
    }

    async fn failed_events(&self, ctx: &OrgContext) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM gateway_webhook_events \
             WHERE org_id = $1 AND status = 'failed' ORDER BY received_at DESC",
            EVENT_COLUMNS
        ))
        .bind(ctx.org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list failed webhook events", e))?;

        rows.into_iter().map(WebhookEventRow::into_record).collect()
    }

    async fn upsert_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<Subscription> {
        // COALESCE against the bind, not EXCLUDED: EXCLUDED carries the
        // insert defaults, which must never overwrite stored values.
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (id, org_id, external_subscription_id, external_customer_id, status,
                 current_period_start, current_period_end, trial_start, trial_end,
                 cancel_at_period_end, cancelled_at, updated_at)
            VALUES ($1, $2, $3, $4, COALESCE($5, 'active'), $6, $7, $8, $9,
                    COALESCE($10, FALSE), $11, NOW())
            ON CONFLICT (org_id, external_subscription_id) DO UPDATE SET
                external_customer_id = COALESCE($4, subscriptions.external_customer_id),
                status = COALESCE($5, subscriptions.status),
                current_period_start = COALESCE($6, subscriptions.current_period_start),
                current_period_end = COALESCE($7, subscriptions.current_period_end),
                trial_start = COALESCE($8, subscriptions.trial_start),
                trial_end = COALESCE($9, subscriptions.trial_end),
                cancel_at_period_end = COALESCE($10, subscriptions.cancel_at_period_end),
                cancelled_at = COALESCE($11, subscriptions.cancelled_at),
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(ctx.org_id)
        .bind(external_subscription_id)
        .bind(patch.external_customer_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.trial_start)
        .bind(patch.trial_end)
        .bind(patch.cancel_at_period_end)
        .bind(patch.cancelled_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                org_id = %ctx.org_id,
                subscription_id = %external_subscription_id,
                error = %e,
                "Failed to upsert subscription"
            );
            db_err("upsert subscription", e)
        })?;

        row.into_record()
    }

    async fn get_subscription(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE org_id = $1 AND external_subscription_id = $2",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(ctx.org_id)
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load subscription", e))?;

        row.map(SubscriptionRow::into_record).transpose()
    }

    async fn recover_subscription_if_past_due(
        &self,
        ctx: &OrgContext,
        external_subscription_id: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', updated_at = NOW()
            WHERE org_id = $1 AND external_subscription_id = $2 AND status = 'past_due'
            "#,
        )
        .bind(ctx.org_id)
        .bind(external_subscription_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("recover past_due subscription", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
        patch: InvoicePatch,
    ) -> BillingResult<Invoice> {
        let row: InvoiceRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices
                (id, org_id, external_invoice_id, external_subscription_id, amount_cents,
                 currency, status, period_start, period_end, paid_at)
            VALUES ($1, $2, $3, $4, COALESCE($5, 0), COALESCE($6, 'usd'),
                    COALESCE($7, 'open'), $8, $9, $10)
            ON CONFLICT (org_id, external_invoice_id) DO UPDATE SET
                external_subscription_id = COALESCE($4, invoices.external_subscription_id),
                amount_cents = COALESCE($5, invoices.amount_cents),
                currency = COALESCE($6, invoices.currency),
                status = COALESCE($7, invoices.status),
                period_start = COALESCE($8, invoices.period_start),
                period_end = COALESCE($9, invoices.period_end),
                paid_at = COALESCE($10, invoices.paid_at)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(ctx.org_id)
        .bind(external_invoice_id)
        .bind(patch.external_subscription_id)
        .bind(patch.amount_cents)
        .bind(patch.currency)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.period_start)
        .bind(patch.period_end)
        .bind(patch.paid_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                org_id = %ctx.org_id,
                invoice_id = %external_invoice_id,
                error = %e,
                "Failed to upsert invoice"
            );
            db_err("upsert invoice", e)
        })?;

        row.into_record()
    }

    async fn get_invoice(
        &self,
        ctx: &OrgContext,
        external_invoice_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE org_id = $1 AND external_invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(ctx.org_id)
        .bind(external_invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load invoice", e))?;

        row.map(InvoiceRow::into_record).transpose()
    }

    async fn insert_refund_request(
        &self,
        ctx: &OrgContext,
        request: RefundRequest,
    ) -> BillingResult<RefundInsert> {
        let inserted: Result<RefundRequestRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO refund_requests
                (id, org_id, payment_reference, original_amount_cents, requested_amount_cents,
                 currency, reason, status, requested_by, escalated, due_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            REFUND_COLUMNS
        ))
        .bind(request.id)
        .bind(ctx.org_id)
        .bind(&request.payment_reference)
        .bind(request.original_amount_cents)
        .bind(request.requested_amount_cents)
        .bind(&request.currency)
        .bind(&request.reason)
        .bind(request.status.as_str())
        .bind(request.requested_by)
        .bind(request.escalated)
        .bind(request.due_by)
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(RefundInsert::Inserted(row.into_record()?)),
            // The partial unique index on (org_id, payment_reference) WHERE
            // status = 'pending' decides ties under concurrency.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(RefundInsert::PendingExists)
            }
            Err(e) => {
                tracing::error!(
                    org_id = %ctx.org_id,
                    payment_reference = %request.payment_reference,
                    error = %e,
                    "Failed to insert refund request"
                );
                Err(db_err("insert refund request", e))
            }
        }
    }

    async fn get_refund_request(
        &self,
        ctx: &OrgContext,
        id: Uuid,
    ) -> BillingResult<Option<RefundRequest>> {
        let row: Option<RefundRequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refund_requests WHERE id = $1 AND org_id = $2",
            REFUND_COLUMNS
        ))
        .bind(id)
        .bind(ctx.org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load refund request", e))?;

        row.map(RefundRequestRow::into_record).transpose()
    }

    async fn transition_refund(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        expected: &[RefundStatus],
        change: RefundChange,
    ) -> BillingResult<Option<RefundRequest>> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

        // The status guard in the WHERE clause is the compare-and-set:
        // under concurrent operators exactly one UPDATE matches.
        let row: Option<RefundRequestRow> = match change {
            RefundChange::Approve { approved_by } => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'approved', approved_by = $4
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .bind(approved_by)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::Reject {
                rejected_by,
                reason,
            } => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'rejected', rejected_by = $4, rejection_reason = $5
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .bind(rejected_by)
                .bind(reason)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::Cancel => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'cancelled'
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::BeginProcess { started_at } => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'processing', processing_started_at = $4
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .bind(started_at)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::Process {
                linked_refund_id,
                processed_at,
            } => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'processed', processing_started_at = NULL,
                        linked_refund_id = $4, processed_at = $5
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .bind(linked_refund_id)
                .bind(processed_at)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::AbortProcess => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET status = 'approved', processing_started_at = NULL
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .fetch_optional(&self.pool)
                .await
            }
            RefundChange::Escalate { escalated_to } => {
                sqlx::query_as(&format!(
                    r#"
                    UPDATE refund_requests
                    SET escalated = TRUE, escalated_to = $4
                    WHERE id = $1 AND org_id = $2 AND status = ANY($3)
                    RETURNING {}
                    "#,
                    REFUND_COLUMNS
                ))
                .bind(id)
                .bind(ctx.org_id)
                .bind(&expected)
                .bind(escalated_to)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            tracing::error!(
                org_id = %ctx.org_id,
                refund_request_id = %id,
                error = %e,
                "Failed to transition refund request"
            );
            db_err("transition refund request", e)
        })?;

        row.map(RefundRequestRow::into_record).transpose()
    }

    async fn overdue_refund_requests(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<RefundRequest>> {
        let rows: Vec<RefundRequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refund_requests \
             WHERE org_id = $1 AND status = 'pending' AND due_by < $2 ORDER BY due_by ASC",
            REFUND_COLUMNS
        ))
        .bind(ctx.org_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list overdue refund requests", e))?;

        rows.into_iter().map(RefundRequestRow::into_record).collect()
    }

    async fn refund_requests_with_status(
        &self,
        ctx: &OrgContext,
        statuses: &[RefundStatus],
    ) -> BillingResult<Vec<RefundRequest>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows: Vec<RefundRequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refund_requests \
             WHERE org_id = $1 AND status = ANY($2) ORDER BY created_at ASC",
            REFUND_COLUMNS
        ))
        .bind(ctx.org_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list refund requests by status", e))?;

        rows.into_iter().map(RefundRequestRow::into_record).collect()
    }

    async fn append_audit(&self, ctx: &OrgContext, entry: RefundAuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refund_audit_log
                (id, org_id, refund_request_id, actor_id, actor_type, action, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(ctx.org_id)
        .bind(entry.refund_request_id)
        .bind(entry.actor_id)
        .bind(entry.actor_type.as_str())
        .bind(entry.action.as_str())
        .bind(&entry.notes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                org_id = %ctx.org_id,
                refund_request_id = %entry.refund_request_id,
                action = %entry.action,
                error = %e,
                "Failed to append refund audit entry"
            );
            db_err("append refund audit entry", e)
        })?;
        Ok(())
    }

    async fn audit_trail(
        &self,
        ctx: &OrgContext,
        refund_request_id: Uuid,
    ) -> BillingResult<Vec<RefundAuditEntry>> {
        // seq is a BIGSERIAL: insertion order even when created_at ties.
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, refund_request_id, actor_id, actor_type, action, notes, created_at
            FROM refund_audit_log
            WHERE org_id = $1 AND refund_request_id = $2
            ORDER BY seq ASC
            "#,
        )
        .bind(ctx.org_id)
        .bind(refund_request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("load refund audit trail", e))?;

        rows.into_iter().map(AuditRow::into_record).collect()
    }
}
