//! Billing error types
//!
//! One enum for the whole crate. Webhook duplicates are deliberately not
//! represented here: a redelivered event is a normal outcome
//! (`IngestOutcome::Duplicate`), not a failure. Handler failures are recorded
//! on the event row and surface as `IngestOutcome::Failed`, never as an `Err`
//! from ingestion.

use thiserror::Error;
use uuid::Uuid;

use crate::refunds::RefundStatus;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook signature header failed verification. The only error a
    /// webhook sender ever sees; rejected before any persistence.
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Payload parsed as JSON but did not match the expected envelope or
    /// object shape for its event type.
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("refund request {0} not found")]
    RefundRequestNotFound(Uuid),

    /// The request was not in a state the attempted operation accepts.
    /// Carries the status observed when the guard failed.
    #[error("cannot {action} refund request in state {current}")]
    InvalidStateTransition {
        current: RefundStatus,
        action: &'static str,
    },

    #[error("requested refund of {requested_cents} cents exceeds original payment of {original_cents} cents")]
    AmountExceedsOriginal {
        requested_cents: i64,
        original_cents: i64,
    },

    #[error("requested refund amount of {requested_cents} cents is not a positive amount")]
    InvalidRefundAmount { requested_cents: i64 },

    /// A PENDING refund request already exists for this payment.
    #[error("a pending refund request already exists for payment {payment_reference}")]
    DuplicatePendingRequest { payment_reference: String },

    /// The gateway declined or failed the refund call. The request stays
    /// APPROVED; `process()` may be retried.
    #[error("gateway refund failed: {message}")]
    GatewayRefund { message: String, retriable: bool },

    #[error("actor {actor_id} is not allowed to {action} refund request {refund_request_id}")]
    AuthorizationDenied {
        actor_id: Uuid,
        refund_request_id: Uuid,
        action: &'static str,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayRefund { retriable: true, .. } | BillingError::Database(_)
        )
    }
}
