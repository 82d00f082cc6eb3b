//! Human-approved refund workflow
//!
//! Refunds move money, so nothing reaches the gateway without an explicit
//! approval step. Requests move through a small state machine:
//!
//! ```text
//! pending -> approved -> processing -> processed
//!    |           |            |
//!    +-> rejected +-> cancelled +-> approved (gateway failure)
//! ```
//!
//! Every transition is a compare-and-set against the expected prior status;
//! under concurrent operators exactly one call wins and the rest see
//! `InvalidStateTransition` with the status that beat them. `processing` is
//! the claim `process` takes before it talks to the gateway: holding it is
//! what keeps a request to at most one gateway refund. Each winning
//! mutation appends one audit entry; the claim itself is not audited.

use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::audit::{RefundActor, RefundAuditAction, RefundAuditEntry};
use crate::client::PaymentGateway;
use crate::context::OrgContext;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, RefundChange, RefundInsert};

const DEFAULT_SLA_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    Pending,
    Approved,
    Rejected,
    /// In-flight claim held across the gateway call. `process()` takes it
    /// from APPROVED before money moves and releases it back on failure.
    Processing,
    Processed,
    Cancelled,
}

impl RefundStatus {
    /// Every status, for store queries that must see the whole table.
    pub const ALL: [RefundStatus; 6] = [
        RefundStatus::Pending,
        RefundStatus::Approved,
        RefundStatus::Rejected,
        RefundStatus::Processing,
        RefundStatus::Processed,
        RefundStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Rejected => "rejected",
            RefundStatus::Processing => "processing",
            RefundStatus::Processed => "processed",
            RefundStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RefundStatus::Pending),
            "approved" => Some(RefundStatus::Approved),
            "rejected" => Some(RefundStatus::Rejected),
            "processing" => Some(RefundStatus::Processing),
            "processed" => Some(RefundStatus::Processed),
            "cancelled" => Some(RefundStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions (escalation included).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefundStatus::Rejected | RefundStatus::Processed | RefundStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A refund request row.
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub id: Uuid,
    pub org_id: Uuid,
    /// Gateway identifier of the captured payment being refunded.
    pub payment_reference: String,
    pub original_amount_cents: i64,
    pub requested_amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub requested_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub rejected_by: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub escalated: bool,
    pub escalated_to: Option<String>,
    /// Review deadline; requests still pending past this are overdue.
    pub due_by: OffsetDateTime,
    /// When the PROCESSING claim was taken; cleared on commit or release.
    pub processing_started_at: Option<OffsetDateTime>,
    /// The gateway's refund id, set when processing commits.
    pub linked_refund_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Caller-supplied fields for a new refund request.
#[derive(Debug, Clone)]
pub struct NewRefundRequest {
    pub payment_reference: String,
    pub original_amount_cents: i64,
    pub requested_amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundPolicy {
    /// Days a request may sit pending before it is considered overdue.
    pub sla_days: i64,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            sla_days: DEFAULT_SLA_DAYS,
        }
    }
}

impl RefundPolicy {
    pub fn from_env() -> Self {
        let sla_days = std::env::var("REFUND_SLA_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SLA_DAYS);
        Self { sla_days }
    }
}

pub struct RefundWorkflow {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    policy: RefundPolicy,
}

impl RefundWorkflow {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: RefundPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
        }
    }

    /// File a refund request. Validates the amount against the original
    /// payment and refuses a second pending request for the same payment.
    pub async fn create(
        &self,
        ctx: &OrgContext,
        actor: RefundActor,
        req: NewRefundRequest,
    ) -> BillingResult<RefundRequest> {
        if req.requested_amount_cents <= 0 {
            return Err(BillingError::InvalidRefundAmount {
                requested_cents: req.requested_amount_cents,
            });
        }
        if req.requested_amount_cents > req.original_amount_cents {
            return Err(BillingError::AmountExceedsOriginal {
                requested_cents: req.requested_amount_cents,
                original_cents: req.original_amount_cents,
            });
        }

        let now = OffsetDateTime::now_utc();
        let row = RefundRequest {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            payment_reference: req.payment_reference.clone(),
            original_amount_cents: req.original_amount_cents,
            requested_amount_cents: req.requested_amount_cents,
            currency: req.currency,
            reason: req.reason,
            status: RefundStatus::Pending,
            requested_by: actor.id,
            approved_by: None,
            rejected_by: None,
            rejection_reason: None,
            escalated: false,
            escalated_to: None,
            due_by: now + Duration::days(self.policy.sla_days),
            processing_started_at: None,
            linked_refund_id: None,
            created_at: now,
            processed_at: None,
        };

        match self.store.insert_refund_request(ctx, row).await? {
            RefundInsert::Inserted(row) => {
                self.append_audit(ctx, row.id, actor, RefundAuditAction::Created, None)
                    .await?;
                tracing::info!(
                    org_id = %ctx.org_id,
                    refund_request_id = %row.id,
                    payment_reference = %row.payment_reference,
                    requested_cents = row.requested_amount_cents,
                    due_by = %row.due_by,
                    "Refund request created"
                );
                Ok(row)
            }
            RefundInsert::PendingExists => Err(BillingError::DuplicatePendingRequest {
                payment_reference: req.payment_reference,
            }),
        }
    }

    /// Approve a pending request. Does not move money; `process` does.
    pub async fn approve(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        approver: RefundActor,
        notes: Option<String>,
    ) -> BillingResult<RefundRequest> {
        let updated = self
            .transition(
                ctx,
                id,
                &[RefundStatus::Pending],
                RefundChange::Approve {
                    approved_by: approver.id,
                },
                "approve",
            )
            .await?;
        self.append_audit(ctx, id, approver, RefundAuditAction::Approved, notes)
            .await?;
        tracing::info!(
            org_id = %ctx.org_id,
            refund_request_id = %id,
            approved_by = %approver.id,
            "Refund request approved"
        );
        Ok(updated)
    }

    /// Reject a pending request with a reason. The reason lands on the row;
    /// the audit entry carries the reviewer's notes, falling back to the
    /// reason so the trail always says why.
    pub async fn reject(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        rejecter: RefundActor,
        reason: String,
        notes: Option<String>,
    ) -> BillingResult<RefundRequest> {
        let updated = self
            .transition(
                ctx,
                id,
                &[RefundStatus::Pending],
                RefundChange::Reject {
                    rejected_by: rejecter.id,
                    reason: reason.clone(),
                },
                "reject",
            )
            .await?;
        let audit_notes = notes.unwrap_or(reason);
        self.append_audit(
            ctx,
            id,
            rejecter,
            RefundAuditAction::Rejected,
            Some(audit_notes),
        )
        .await?;
        tracing::info!(
            org_id = %ctx.org_id,
            refund_request_id = %id,
            rejected_by = %rejecter.id,
            "Refund request rejected"
        );
        Ok(updated)
    }

    /// Withdraw a request before it is processed. Allowed for the original
    /// requester and for privileged actors; valid from pending or approved.
    pub async fn cancel(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        actor: RefundActor,
    ) -> BillingResult<RefundRequest> {
        let row = self.get(ctx, id).await?;
        if actor.id != row.requested_by && !actor.actor_type.is_privileged() {
            tracing::warn!(
                org_id = %ctx.org_id,
                refund_request_id = %id,
                actor_id = %actor.id,
                "Cancel denied: not the requester and not privileged"
            );
            return Err(BillingError::AuthorizationDenied {
                actor_id: actor.id,
                refund_request_id: id,
                action: "cancel",
            });
        }

        let updated = self
            .transition(
                ctx,
                id,
                &[RefundStatus::Pending, RefundStatus::Approved],
                RefundChange::Cancel,
                "cancel",
            )
            .await?;
        self.append_audit(ctx, id, actor, RefundAuditAction::Cancelled, None)
            .await?;
        tracing::info!(
            org_id = %ctx.org_id,
            refund_request_id = %id,
            cancelled_by = %actor.id,
            "Refund request cancelled"
        );
        Ok(updated)
    }

    /// Flag a request for attention. Valid from any non-terminal state and
    /// repeatable; every call is audited even if the target is unchanged.
    pub async fn escalate(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        actor: RefundActor,
        target: String,
    ) -> BillingResult<RefundRequest> {
        let updated = self
            .transition(
                ctx,
                id,
                &[
                    RefundStatus::Pending,
                    RefundStatus::Approved,
                    RefundStatus::Processing,
                ],
                RefundChange::Escalate {
                    escalated_to: target.clone(),
                },
                "escalate",
            )
            .await?;
        self.append_audit(
            ctx,
            id,
            actor,
            RefundAuditAction::Escalated,
            Some(format!("escalated to {}", target)),
        )
        .await?;
        tracing::warn!(
            org_id = %ctx.org_id,
            refund_request_id = %id,
            escalated_to = %target,
            "Refund request escalated"
        );
        Ok(updated)
    }

    /// Execute an approved refund against the gateway.
    ///
    /// The row is claimed PROCESSING before the gateway is called; only
    /// the claim holder talks to the gateway, so concurrent calls cannot
    /// disburse twice. A gateway failure releases the claim back to
    /// APPROVED and the call stays retriable. A crash while the claim is
    /// held leaves a PROCESSING row that the reconciliation report flags
    /// once it goes stale.
    pub async fn process(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        actor: RefundActor,
    ) -> BillingResult<RefundRequest> {
        let row = self
            .transition(
                ctx,
                id,
                &[RefundStatus::Approved],
                RefundChange::BeginProcess {
                    started_at: OffsetDateTime::now_utc(),
                },
                "process",
            )
            .await?;

        let refund = match self
            .gateway
            .create_refund(
                &row.payment_reference,
                row.requested_amount_cents,
                row.reason.as_deref(),
            )
            .await
        {
            Ok(refund) => refund,
            Err(e) => {
                tracing::warn!(
                    org_id = %ctx.org_id,
                    refund_request_id = %id,
                    payment_reference = %row.payment_reference,
                    retriable = e.is_retriable(),
                    error = %e,
                    "Gateway refund failed; releasing claim so the request \
                     can be retried"
                );
                self.release_claim(ctx, id).await;
                return Err(e);
            }
        };

        match self
            .store
            .transition_refund(
                ctx,
                id,
                &[RefundStatus::Processing],
                RefundChange::Process {
                    linked_refund_id: refund.refund_id.clone(),
                    processed_at: OffsetDateTime::now_utc(),
                },
            )
            .await?
        {
            Some(updated) => {
                self.append_audit(
                    ctx,
                    id,
                    actor,
                    RefundAuditAction::Processed,
                    Some(format!("gateway refund {}", refund.refund_id)),
                )
                .await?;
                tracing::info!(
                    org_id = %ctx.org_id,
                    refund_request_id = %id,
                    gateway_refund_id = %refund.refund_id,
                    amount_cents = updated.requested_amount_cents,
                    "Refund processed"
                );
                Ok(updated)
            }
            None => {
                // No workflow operation moves a row out of PROCESSING, so
                // losing the claim at commit means the store changed under
                // us. Money has moved; only the reconciliation report can
                // say what to do next.
                let current = self.get(ctx, id).await?;
                tracing::error!(
                    org_id = %ctx.org_id,
                    refund_request_id = %id,
                    gateway_refund_id = %refund.refund_id,
                    current_status = %current.status,
                    "CRITICAL: gateway refund succeeded but the claim was \
                     gone at commit; run the refund reconciliation report"
                );
                Err(BillingError::InvalidStateTransition {
                    current: current.status,
                    action: "process",
                })
            }
        }
    }

    /// Put a claimed row back to APPROVED after a failed gateway call.
    ///
    /// The gateway error is what the caller must see, so a store failure
    /// here is logged rather than returned; the claim then sits until the
    /// reconciliation report flags it stale.
    async fn release_claim(&self, ctx: &OrgContext, id: Uuid) {
        match self
            .store
            .transition_refund(
                ctx,
                id,
                &[RefundStatus::Processing],
                RefundChange::AbortProcess,
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(
                    org_id = %ctx.org_id,
                    refund_request_id = %id,
                    "Claim release found the row no longer processing"
                );
            }
            Err(e) => {
                tracing::error!(
                    org_id = %ctx.org_id,
                    refund_request_id = %id,
                    error = %e,
                    "Claim release failed; the row stays claimed until \
                     reconciliation reports it"
                );
            }
        }
    }

    pub async fn get(&self, ctx: &OrgContext, id: Uuid) -> BillingResult<RefundRequest> {
        self.store
            .get_refund_request(ctx, id)
            .await?
            .ok_or(BillingError::RefundRequestNotFound(id))
    }

    /// Full audit trail in creation order. A missing request is an error,
    /// not an empty trail.
    pub async fn audit_trail(
        &self,
        ctx: &OrgContext,
        id: Uuid,
    ) -> BillingResult<Vec<RefundAuditEntry>> {
        self.get(ctx, id).await?;
        self.store.audit_trail(ctx, id).await
    }

    /// Pending requests whose review deadline has passed, oldest deadline
    /// first. Pull-based: callers decide when to look.
    pub async fn overdue(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<RefundRequest>> {
        self.store.overdue_refund_requests(ctx, now).await
    }

    /// Requests in any of the given states, oldest first.
    pub async fn with_status(
        &self,
        ctx: &OrgContext,
        statuses: &[RefundStatus],
    ) -> BillingResult<Vec<RefundRequest>> {
        self.store.refund_requests_with_status(ctx, statuses).await
    }

    async fn transition(
        &self,
        ctx: &OrgContext,
        id: Uuid,
        expected: &[RefundStatus],
        change: RefundChange,
        action: &'static str,
    ) -> BillingResult<RefundRequest> {
        match self.store.transition_refund(ctx, id, expected, change).await? {
            Some(row) => Ok(row),
            None => {
                // Either the row does not exist (for this org) or its
                // status changed; re-read to tell the caller which.
                let current = self.get(ctx, id).await?;
                Err(BillingError::InvalidStateTransition {
                    current: current.status,
                    action,
                })
            }
        }
    }

    async fn append_audit(
        &self,
        ctx: &OrgContext,
        refund_request_id: Uuid,
        actor: RefundActor,
        action: RefundAuditAction,
        notes: Option<String>,
    ) -> BillingResult<()> {
        let mut entry = RefundAuditEntry::new(ctx, refund_request_id, actor, action);
        if let Some(notes) = notes {
            entry = entry.with_notes(notes);
        }
        self.store.append_audit(ctx, entry).await
    }
}

/// Builds a pending refund request row directly, bypassing the workflow.
#[cfg(test)]
pub fn test_request(
    ctx: &OrgContext,
    payment_reference: &str,
    original_amount_cents: i64,
    requested_amount_cents: i64,
) -> RefundRequest {
    let now = OffsetDateTime::now_utc();
    RefundRequest {
        id: Uuid::new_v4(),
        org_id: ctx.org_id,
        payment_reference: payment_reference.to_string(),
        original_amount_cents,
        requested_amount_cents,
        currency: "usd".to_string(),
        reason: None,
        status: RefundStatus::Pending,
        requested_by: Uuid::new_v4(),
        approved_by: None,
        rejected_by: None,
        rejection_reason: None,
        escalated: false,
        escalated_to: None,
        due_by: now + Duration::days(DEFAULT_SLA_DAYS),
        processing_started_at: None,
        linked_refund_id: None,
        created_at: now,
        processed_at: None,
    }
}
