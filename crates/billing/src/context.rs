//! Explicit org scoping for every billing operation
//!
//! Tenancy is passed as a parameter, never read from ambient state. Every
//! row written by this crate is stamped with the `org_id` from the context
//! it was written under, and every query is scoped by it.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrgContext {
    pub org_id: Uuid,
}

impl OrgContext {
    pub fn new(org_id: Uuid) -> Self {
        Self { org_id }
    }
}

impl std::fmt::Display for OrgContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.org_id)
    }
}
