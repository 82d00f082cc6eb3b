//! Refund request workflow routes
//!
//! Creation, review decisions, execution against the payment gateway, the
//! audit trail, and the operator reconciliation report.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use pacelog_billing::{
    NewRefundRequest, OrgContext, RefundAuditEntry, RefundRequest, RefundStatus,
};

use crate::{
    error::{ApiError, ApiResult},
    routes::actor_from_headers,
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateRefundBody {
    pub payment_reference: String,
    pub original_amount_cents: i64,
    pub requested_amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub reason: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EscalateBody {
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct ListRefundsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefundRequestResponse {
    pub id: Uuid,
    pub payment_reference: String,
    pub original_amount_cents: i64,
    pub requested_amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub status: String,
    pub requested_by: Uuid,
    pub approved_by: Option<Uuid>,
    pub rejected_by: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub escalated: bool,
    pub escalated_to: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub due_by: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub linked_refund_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl From<RefundRequest> for RefundRequestResponse {
    fn from(r: RefundRequest) -> Self {
        Self {
            id: r.id,
            payment_reference: r.payment_reference,
            original_amount_cents: r.original_amount_cents,
            requested_amount_cents: r.requested_amount_cents,
            currency: r.currency,
            reason: r.reason,
            status: r.status.as_str().to_string(),
            requested_by: r.requested_by,
            approved_by: r.approved_by,
            rejected_by: r.rejected_by,
            rejection_reason: r.rejection_reason,
            escalated: r.escalated,
            escalated_to: r.escalated_to,
            due_by: r.due_by,
            processing_started_at: r.processing_started_at,
            linked_refund_id: r.linked_refund_id,
            created_at: r.created_at,
            processed_at: r.processed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefundListResponse {
    pub requests: Vec<RefundRequestResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct AuditEntryResponse {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub actor_type: String,
    pub action: String,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<RefundAuditEntry> for AuditEntryResponse {
    fn from(e: RefundAuditEntry) -> Self {
        Self {
            id: e.id,
            actor_id: e.actor_id,
            actor_type: e.actor_type.as_str().to_string(),
            action: e.action.as_str().to_string(),
            notes: e.notes,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    pub refund_request_id: Uuid,
    pub entries: Vec<AuditEntryResponse>,
}

#[derive(Debug, Serialize)]
pub struct ViolationResponse {
    pub invariant: String,
    pub refund_request_id: Uuid,
    pub payment_reference: String,
    pub description: String,
    pub severity: String,
}

#[derive(Debug, Serialize)]
pub struct ReconciliationReportResponse {
    pub healthy: bool,
    pub requests_checked: usize,
    pub violations: Vec<ViolationResponse>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn create_refund_request(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CreateRefundBody>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;

    tracing::info!(
        org_id = %ctx.org_id,
        actor_id = %actor.id,
        payment_reference = %body.payment_reference,
        requested_amount_cents = body.requested_amount_cents,
        "Creating refund request"
    );

    let created = state
        .billing
        .refunds
        .create(
            &ctx,
            actor,
            NewRefundRequest {
                payment_reference: body.payment_reference,
                original_amount_cents: body.original_amount_cents,
                requested_amount_cents: body.requested_amount_cents,
                currency: body.currency,
                reason: body.reason,
            },
        )
        .await?;

    Ok(Json(created.into()))
}

pub async fn list_refund_requests(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    Query(query): Query<ListRefundsQuery>,
) -> ApiResult<Json<RefundListResponse>> {
    let ctx = OrgContext::new(org_id);

    let statuses: Vec<RefundStatus> = match query.status.as_deref() {
        Some(raw) => {
            let status = RefundStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", raw)))?;
            vec![status]
        }
        None => RefundStatus::ALL.to_vec(),
    };

    let rows = state.billing.refunds.with_status(&ctx, &statuses).await?;
    let requests: Vec<RefundRequestResponse> = rows.into_iter().map(Into::into).collect();

    let total = requests.len();
    Ok(Json(RefundListResponse { requests, total }))
}

/// Pending requests past their review deadline, oldest deadline first.
pub async fn list_overdue(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<RefundListResponse>> {
    let ctx = OrgContext::new(org_id);
    let rows = state
        .billing
        .refunds
        .overdue(&ctx, OffsetDateTime::now_utc())
        .await?;
    let requests: Vec<RefundRequestResponse> = rows.into_iter().map(Into::into).collect();

    let total = requests.len();
    Ok(Json(RefundListResponse { requests, total }))
}

pub async fn get_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let row = state.billing.refunds.get(&ctx, id).await?;
    Ok(Json(row.into()))
}

pub async fn approve_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Option<Json<ApproveBody>>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;
    let notes = body.and_then(|Json(b)| b.notes);

    tracing::info!(org_id = %ctx.org_id, refund_request_id = %id, actor_id = %actor.id, "Approving refund request");
    let updated = state.billing.refunds.approve(&ctx, id, actor, notes).await?;
    Ok(Json(updated.into()))
}

pub async fn reject_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<RejectBody>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;

    tracing::info!(org_id = %ctx.org_id, refund_request_id = %id, actor_id = %actor.id, "Rejecting refund request");
    let updated = state
        .billing
        .refunds
        .reject(&ctx, id, actor, body.reason, body.notes)
        .await?;
    Ok(Json(updated.into()))
}

pub async fn cancel_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;

    tracing::info!(org_id = %ctx.org_id, refund_request_id = %id, actor_id = %actor.id, "Cancelling refund request");
    let updated = state.billing.refunds.cancel(&ctx, id, actor).await?;
    Ok(Json(updated.into()))
}

pub async fn escalate_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    Json(body): Json<EscalateBody>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;

    tracing::info!(
        org_id = %ctx.org_id,
        refund_request_id = %id,
        actor_id = %actor.id,
        target = %body.target,
        "Escalating refund request"
    );
    let updated = state
        .billing
        .refunds
        .escalate(&ctx, id, actor, body.target)
        .await?;
    Ok(Json(updated.into()))
}

pub async fn process_refund_request(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> ApiResult<Json<RefundRequestResponse>> {
    let ctx = OrgContext::new(org_id);
    let actor = actor_from_headers(&headers)?;

    tracing::info!(org_id = %ctx.org_id, refund_request_id = %id, actor_id = %actor.id, "Processing refund request");
    let updated = state.billing.refunds.process(&ctx, id, actor).await?;
    Ok(Json(updated.into()))
}

pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path((org_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<AuditTrailResponse>> {
    let ctx = OrgContext::new(org_id);
    let entries = state.billing.refunds.audit_trail(&ctx, id).await?;

    Ok(Json(AuditTrailResponse {
        refund_request_id: id,
        entries: entries.into_iter().map(Into::into).collect(),
    }))
}

/// Compare local refund state against the gateway and report divergence.
/// Read-only: fixing a divergent row is a deliberate operator action.
pub async fn reconciliation_report(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<ReconciliationReportResponse>> {
    let ctx = OrgContext::new(org_id);

    tracing::info!(org_id = %ctx.org_id, "Running refund reconciliation report");
    let summary = state
        .billing
        .reconciler
        .check(&ctx, OffsetDateTime::now_utc())
        .await?;

    let violations: Vec<ViolationResponse> = summary
        .violations
        .into_iter()
        .map(|v| ViolationResponse {
            invariant: v.invariant,
            refund_request_id: v.refund_request_id,
            payment_reference: v.payment_reference,
            description: v.description,
            severity: v.severity.to_string(),
        })
        .collect();

    Ok(Json(ReconciliationReportResponse {
        healthy: summary.healthy,
        requests_checked: summary.requests_checked,
        violations,
        checked_at: summary.checked_at,
    }))
}
