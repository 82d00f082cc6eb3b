//! API error handling
//!
//! One error type for every handler. Billing errors carry their own HTTP
//! mapping; everything else is a bad request or an internal error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pacelog_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            ApiError::Billing(e) => billing_status(e),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "Bad request", Some(msg.clone()))
            }
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

fn billing_status(e: &BillingError) -> (StatusCode, &'static str, Option<String>) {
    match e {
        BillingError::SignatureInvalid => {
            (StatusCode::BAD_REQUEST, "Invalid webhook signature", None)
        }
        BillingError::InvalidPayload(_) => (
            StatusCode::BAD_REQUEST,
            "Invalid webhook payload",
            Some(e.to_string()),
        ),
        BillingError::InvalidRefundAmount { .. } | BillingError::AmountExceedsOriginal { .. } => (
            StatusCode::BAD_REQUEST,
            "Invalid refund amount",
            Some(e.to_string()),
        ),
        BillingError::AuthorizationDenied { .. } => {
            (StatusCode::FORBIDDEN, "Forbidden", Some(e.to_string()))
        }
        BillingError::RefundRequestNotFound(_) => {
            (StatusCode::NOT_FOUND, "Not found", Some(e.to_string()))
        }
        BillingError::InvalidStateTransition { .. }
        | BillingError::DuplicatePendingRequest { .. } => {
            (StatusCode::CONFLICT, "Conflict", Some(e.to_string()))
        }
        BillingError::GatewayRefund { .. } => {
            tracing::error!(error = %e, "Gateway refund failed");
            (
                StatusCode::BAD_GATEWAY,
                "Payment gateway error",
                Some(e.to_string()),
            )
        }
        BillingError::Database(_) | BillingError::Config(_) => {
            tracing::error!(error = %e, "Billing internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                None,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacelog_billing::RefundStatus;
    use uuid::Uuid;

    fn status_of(e: BillingError) -> StatusCode {
        ApiError::from(e).into_response().status()
    }

    #[test]
    fn signature_failures_are_bad_requests() {
        assert_eq!(status_of(BillingError::SignatureInvalid), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn amount_guards_are_bad_requests() {
        assert_eq!(
            status_of(BillingError::AmountExceedsOriginal {
                requested_cents: 20_000,
                original_cents: 10_000,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::InvalidRefundAmount { requested_cents: 0 }),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn state_conflicts_map_to_409() {
        assert_eq!(
            status_of(BillingError::InvalidStateTransition {
                current: RefundStatus::Rejected,
                action: "approve",
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::DuplicatePendingRequest {
                payment_reference: "ch_1".to_string(),
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn missing_request_is_404_and_denial_is_403() {
        assert_eq!(
            status_of(BillingError::RefundRequestNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::AuthorizationDenied {
                actor_id: Uuid::new_v4(),
                refund_request_id: Uuid::new_v4(),
                action: "cancel",
            }),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn gateway_and_internal_failures_map_to_5xx() {
        assert_eq!(
            status_of(BillingError::GatewayRefund {
                message: "upstream 500".to_string(),
                retriable: true,
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BillingError::Database("connection reset".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
