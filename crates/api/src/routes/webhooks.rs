//! Gateway webhook intake
//!
//! The provider POSTs signed event envelopes here and retries on anything
//! but a 2xx. Verification happens before any persistence; a bad signature
//! is the only processing problem the sender ever sees.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use pacelog_billing::OrgContext;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
}

/// Receive a signed gateway webhook. Answers quickly either way: handler
/// failures are recorded against the stored event, not returned to the
/// sender, so the provider does not redeliver a poison event forever.
pub async fn handle_gateway_webhook(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    let ctx = OrgContext::new(org_id);
    let event = state.billing.ingestor.verify(&body, signature)?;

    tracing::info!(
        org_id = %ctx.org_id,
        provider_event_id = %event.provider_event_id,
        event_type = %event.event_type,
        "Webhook signature verified"
    );

    let outcome = state.billing.ingestor.ingest(&ctx, event).await?;

    Ok(Json(WebhookAck {
        received: true,
        outcome: outcome.as_str().to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct FailedWebhookEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub error_detail: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct FailedEventsResponse {
    pub events: Vec<FailedWebhookEvent>,
    pub total: usize,
}

/// Events whose handlers failed. Redeliveries never re-run a failed
/// event, so this list is where operators find work to replay.
pub async fn list_failed_events(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<FailedEventsResponse>> {
    let ctx = OrgContext::new(org_id);
    let failed = state.billing.ingestor.failed_events(&ctx).await?;

    let events: Vec<FailedWebhookEvent> = failed
        .into_iter()
        .map(|e| FailedWebhookEvent {
            provider_event_id: e.provider_event_id,
            event_type: e.event_type,
            error_detail: e.error_detail,
            received_at: e.received_at,
        })
        .collect();

    let total = events.len();
    Ok(Json(FailedEventsResponse { events, total }))
}
