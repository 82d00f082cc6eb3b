// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Pacelog Billing Module
//!
//! Keeps local billing state consistent with the payment gateway and runs
//! the human-approved refund workflow.
//!
//! ## Features
//!
//! - **Webhook Ingestion**: Signature verification, atomic deduplication,
//!   at-least-once delivery tolerance
//! - **Reconciliation**: Subscriptions and invoices mirrored from gateway
//!   events via idempotent upserts
//! - **Refund Workflow**: Request, approve or reject, cancel, escalate,
//!   and process refunds, with an append-only audit trail
//! - **Consistency Checks**: Refund state compared against the gateway for
//!   operator review
//! - **Notifications**: Customer-facing messages on payment success,
//!   payment failure, and cancellation

pub mod audit;
pub mod client;
pub mod context;
pub mod error;
pub mod event;
pub mod invariants;
pub mod notify;
pub mod reconciliation;
pub mod refunds;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{ActorType, RefundActor, RefundAuditAction, RefundAuditEntry};

// Client
pub use client::{GatewayConfig, GatewayRefund, MockGateway, PaymentGateway, StripeGateway};

// Context
pub use context::OrgContext;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{EventKind, GatewayEvent, InvoicePayload, SubscriptionPayload};

// Invariants
pub use invariants::{
    ReconciliationSummary, RefundReconciler, RefundViolation, ViolationSeverity,
};

// Notifications
pub use notify::{
    LogNotifier, Notifier, PaymentFailed, PaymentSucceeded, RecordingNotifier,
    SubscriptionCancelled,
};

// Reconciliation
pub use reconciliation::{
    Invoice, InvoiceStatus, ReconciliationEngine, Subscription, SubscriptionStatus,
};

// Refunds
pub use refunds::{NewRefundRequest, RefundPolicy, RefundRequest, RefundStatus, RefundWorkflow};

// Store
pub use store::{memory::MemoryStore, postgres::PgStore, BillingStore};

// Webhooks
pub use webhooks::{IngestOutcome, WebhookEventRecord, WebhookEventStatus, WebhookIngestor};

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub ingestor: WebhookIngestor,
    pub reconciliation: ReconciliationEngine,
    pub refunds: RefundWorkflow,
    pub reconciler: RefundReconciler,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by
    /// Postgres and the real gateway.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = GatewayConfig::from_env()?;
        let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(config.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());

        Ok(Self::with_components(
            store,
            gateway,
            notifier,
            config.webhook_secret,
            RefundPolicy::from_env(),
        ))
    }

    /// Create a new billing service with explicit components. Tests swap in
    /// `MemoryStore`, `MockGateway`, and `RecordingNotifier` here.
    pub fn with_components(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        webhook_secret: String,
        policy: RefundPolicy,
    ) -> Self {
        let reconciliation = ReconciliationEngine::new(store.clone(), notifier);

        Self {
            ingestor: WebhookIngestor::new(store.clone(), reconciliation.clone(), webhook_secret),
            reconciliation,
            refunds: RefundWorkflow::new(store.clone(), gateway.clone(), policy),
            reconciler: RefundReconciler::new(store, gateway),
        }
    }
}
