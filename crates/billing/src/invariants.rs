//! Refund consistency checks
//!
//! `process()` holds a PROCESSING claim across the gateway call and
//! commits the local row only after the gateway confirms, so a crash while
//! the claim is held leaves either a stuck claim or money moved with no
//! local record. These checks compare every refund request, whatever its
//! status, against the gateway's view and report discrepancies for an
//! operator to resolve; they read both sides and never write.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::PaymentGateway;
use crate::context::OrgContext;
use crate::error::BillingResult;
use crate::refunds::{RefundRequest, RefundStatus};
use crate::store::BillingStore;

/// An APPROVED request younger than this can still be picked up by a
/// `process()` call, so its payment is exempt from the unlinked-refund
/// checks.
const APPROVED_GRACE: Duration = Duration::hours(1);

/// A PROCESSING claim older than this is treated as a crashed `process()`
/// call rather than one still in flight.
const PROCESSING_GRACE: Duration = Duration::minutes(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money moved without a matching local record, or vice versa.
    Critical,
    /// Needs attention but nothing is financially inconsistent.
    Warning,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundViolation {
    /// Which check was violated
    pub invariant: String,
    pub refund_request_id: Uuid,
    pub payment_reference: String,
    /// Human-readable description with enough context to debug
    pub description: String,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub checked_at: OffsetDateTime,
    /// Refund requests examined
    pub requests_checked: usize,
    pub violations: Vec<RefundViolation>,
    pub healthy: bool,
}

/// Compares local refund requests against the gateway.
pub struct RefundReconciler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl RefundReconciler {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Run all checks for one org.
    ///
    /// Works payment by payment: every gateway refund for a payment must
    /// be linked by some local request, whatever state that request ended
    /// up in, and every linked refund must exist at the gateway.
    ///
    /// Reported, never repaired: whether an unlinked gateway refund means
    /// "mark the request processed" or "investigate a double refund" is an
    /// operator decision.
    pub async fn check(
        &self,
        ctx: &OrgContext,
        now: OffsetDateTime,
    ) -> BillingResult<ReconciliationSummary> {
        let rows = self
            .store
            .refund_requests_with_status(ctx, &RefundStatus::ALL)
            .await?;
        let requests_checked = rows.len();

        // Group by payment so each reference is compared against exactly
        // one gateway listing, in deterministic order.
        let mut by_reference: BTreeMap<&str, Vec<&RefundRequest>> = BTreeMap::new();
        for row in &rows {
            by_reference
                .entry(row.payment_reference.as_str())
                .or_default()
                .push(row);
        }

        let mut violations = Vec::new();

        for (reference, requests) in &by_reference {
            let at_gateway: HashSet<String> = self
                .gateway
                .list_refunds(reference)
                .await?
                .into_iter()
                .map(|r| r.refund_id)
                .collect();

            // Every gateway refund id some local request links, in any
            // status. A cancelled or rejected row still accounts for the
            // refund it once committed.
            let accounted: HashSet<&str> = requests
                .iter()
                .filter_map(|r| r.linked_refund_id.as_deref())
                .collect();

            for row in requests {
                match row.status {
                    RefundStatus::Processed => match &row.linked_refund_id {
                        Some(refund_id) if !at_gateway.contains(refund_id) => {
                            violations.push(RefundViolation {
                                invariant: "linked_refund_missing_at_gateway".to_string(),
                                refund_request_id: row.id,
                                payment_reference: row.payment_reference.clone(),
                                description: format!(
                                    "Request is processed with gateway refund {} but the gateway does not list it",
                                    refund_id
                                ),
                                severity: ViolationSeverity::Critical,
                            });
                        }
                        None => {
                            violations.push(RefundViolation {
                                invariant: "processed_without_linked_refund".to_string(),
                                refund_request_id: row.id,
                                payment_reference: row.payment_reference.clone(),
                                description: "Request is processed but records no gateway refund id"
                                    .to_string(),
                                severity: ViolationSeverity::Critical,
                            });
                        }
                        _ => {}
                    },
                    RefundStatus::Processing => {
                        let started = row.processing_started_at.unwrap_or(row.created_at);
                        if now - started > PROCESSING_GRACE {
                            violations.push(RefundViolation {
                                invariant: "processing_claim_stalled".to_string(),
                                refund_request_id: row.id,
                                payment_reference: row.payment_reference.clone(),
                                description: format!(
                                    "Request has held its processing claim since {} with no commit; \
                                     the process() call likely crashed at the gateway",
                                    started
                                ),
                                severity: ViolationSeverity::Critical,
                            });
                        }
                    }
                    RefundStatus::Pending => {
                        if row.due_by < now {
                            violations.push(RefundViolation {
                                invariant: "pending_past_review_deadline".to_string(),
                                refund_request_id: row.id,
                                payment_reference: row.payment_reference.clone(),
                                description: format!(
                                    "Request has been pending since {} and its review deadline {} has passed",
                                    row.created_at, row.due_by
                                ),
                                severity: ViolationSeverity::Warning,
                            });
                        }
                    }
                    _ => {}
                }
            }

            let mut unaccounted: Vec<&str> = at_gateway
                .iter()
                .map(String::as_str)
                .filter(|id| !accounted.contains(*id))
                .collect();
            if unaccounted.is_empty() {
                continue;
            }
            unaccounted.sort_unstable();

            // A request mid-process explains an unlinked gateway refund,
            // so the whole payment waits until nothing on it is plausibly
            // in flight.
            let in_flight = requests.iter().any(|r| match r.status {
                RefundStatus::Approved => now - r.created_at <= APPROVED_GRACE,
                RefundStatus::Processing => {
                    now - r.processing_started_at.unwrap_or(r.created_at) <= PROCESSING_GRACE
                }
                _ => false,
            });
            if in_flight {
                continue;
            }

            let mut unaccounted = unaccounted.into_iter();

            // A stale approved request next to an unlinked refund is the
            // crashed-commit signature: the gateway confirmed but the row
            // never moved on.
            if let Some(stale) = requests.iter().find(|r| r.status == RefundStatus::Approved) {
                if let Some(refund_id) = unaccounted.next() {
                    violations.push(RefundViolation {
                        invariant: "approved_already_refunded".to_string(),
                        refund_request_id: stale.id,
                        payment_reference: reference.to_string(),
                        description: format!(
                            "Gateway holds refund {} for payment {} but the request is still approved; \
                             a process() call likely crashed after the gateway confirmed",
                            refund_id, reference
                        ),
                        severity: ViolationSeverity::Critical,
                    });
                }
            }

            // Whatever remains matches no local request at all; pin it to
            // the newest request so the report has a row to start from.
            if let Some(anchor) = requests.iter().max_by_key(|r| r.created_at) {
                for refund_id in unaccounted {
                    violations.push(RefundViolation {
                        invariant: "unlinked_gateway_refund".to_string(),
                        refund_request_id: anchor.id,
                        payment_reference: reference.to_string(),
                        description: format!(
                            "Gateway holds refund {} for payment {} that no local request links",
                            refund_id, reference
                        ),
                        severity: ViolationSeverity::Critical,
                    });
                }
            }
        }

        if !violations.is_empty() {
            tracing::warn!(
                org_id = %ctx.org_id,
                violations = violations.len(),
                requests_checked = requests_checked,
                "Refund reconciliation found violations"
            );
        }

        let healthy = violations.is_empty();
        Ok(ReconciliationSummary {
            checked_at: now,
            requests_checked,
            violations,
            healthy,
        })
    }
}
