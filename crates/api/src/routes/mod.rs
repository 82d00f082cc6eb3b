//! HTTP routes
//!
//! The edge proxy authenticates callers and forwards the acting user in
//! `x-actor-id` / `x-actor-role` headers; handlers here only translate
//! HTTP to billing calls and back.

pub mod refunds;
pub mod webhooks;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use pacelog_billing::{ActorType, RefundActor};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/gateway/{org_id}",
            post(webhooks::handle_gateway_webhook),
        )
        .route(
            "/orgs/{org_id}/billing/webhook-events/failed",
            get(webhooks::list_failed_events),
        )
        .route(
            "/orgs/{org_id}/billing/refunds",
            post(refunds::create_refund_request).get(refunds::list_refund_requests),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/overdue",
            get(refunds::list_overdue),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}",
            get(refunds::get_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/approve",
            post(refunds::approve_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/reject",
            post(refunds::reject_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/cancel",
            post(refunds::cancel_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/escalate",
            post(refunds::escalate_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/process",
            post(refunds::process_refund_request),
        )
        .route(
            "/orgs/{org_id}/billing/refunds/{id}/audit",
            get(refunds::get_audit_trail),
        )
        .route(
            "/orgs/{org_id}/billing/reconciliation",
            get(refunds::reconciliation_report),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Resolve the acting user from the forwarded identity headers. A missing
/// role header means a regular user; an unrecognized role is rejected
/// rather than silently downgraded.
pub(crate) fn actor_from_headers(headers: &HeaderMap) -> ApiResult<RefundActor> {
    let id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError::BadRequest("missing or invalid x-actor-id header".to_string()))?;

    let actor_type = match headers.get("x-actor-role").and_then(|v| v.to_str().ok()) {
        None => ActorType::User,
        Some(raw) => ActorType::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unrecognized x-actor-role: {}", raw)))?,
    };

    Ok(RefundActor { id, actor_type })
}
