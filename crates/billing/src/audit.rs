//! Refund workflow audit log
//!
//! Append-only: exactly one entry per successful mutating workflow call,
//! including escalations that change no primary state. Entries are never
//! updated or deleted; the trail for a request is read back in creation
//! order.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::context::OrgContext;

/// Workflow transitions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundAuditAction {
    Created,
    Approved,
    Rejected,
    Cancelled,
    Escalated,
    Processed,
}

impl RefundAuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundAuditAction::Created => "CREATED",
            RefundAuditAction::Approved => "APPROVED",
            RefundAuditAction::Rejected => "REJECTED",
            RefundAuditAction::Cancelled => "CANCELLED",
            RefundAuditAction::Escalated => "ESCALATED",
            RefundAuditAction::Processed => "PROCESSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(RefundAuditAction::Created),
            "APPROVED" => Some(RefundAuditAction::Approved),
            "REJECTED" => Some(RefundAuditAction::Rejected),
            "CANCELLED" => Some(RefundAuditAction::Cancelled),
            "ESCALATED" => Some(RefundAuditAction::Escalated),
            "PROCESSED" => Some(RefundAuditAction::Processed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefundAuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// An org member acting on their own request.
    User,
    /// Privileged staff.
    Admin,
    /// Automated processes (reconciliation, migrations).
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Admin => "admin",
            ActorType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ActorType::User),
            "admin" => Some(ActorType::Admin),
            "system" => Some(ActorType::System),
            _ => None,
        }
    }

    /// Privileged actors may act on requests they did not file.
    pub fn is_privileged(&self) -> bool {
        matches!(self, ActorType::Admin | ActorType::System)
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity handed to every workflow call; resolved by the caller (the API
/// layer reads it from upstream auth), never from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundActor {
    pub id: Uuid,
    pub actor_type: ActorType,
}

impl RefundActor {
    pub fn user(id: Uuid) -> Self {
        Self {
            id,
            actor_type: ActorType::User,
        }
    }

    pub fn admin(id: Uuid) -> Self {
        Self {
            id,
            actor_type: ActorType::Admin,
        }
    }

    pub fn system(id: Uuid) -> Self {
        Self {
            id,
            actor_type: ActorType::System,
        }
    }
}

/// One appended audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundAuditEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub refund_request_id: Uuid,
    pub actor_id: Uuid,
    pub actor_type: ActorType,
    pub action: RefundAuditAction,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
}

impl RefundAuditEntry {
    pub fn new(
        ctx: &OrgContext,
        refund_request_id: Uuid,
        actor: RefundActor,
        action: RefundAuditAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            refund_request_id,
            actor_id: actor.id,
            actor_type: actor.actor_type,
            action,
            notes: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
