/// Authorization policy for membership ops.
///
/// The policy is consulted with the issuer's role *in the op's causal
/// past*, so every replica running the same policy reaches the same
/// verdict. All replicas of a group must agree on the policy.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crdt::ops::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Invite,
    Remove,
    Promote,
    /// Removing yourself.
    Leave,
    SetMetadata,
}

pub trait MembershipPolicy: Send + Sync + std::fmt::Debug {
    fn permits(&self, issuer_role: Role, action: Action) -> bool;
}

/// Any accepted member may invite, remove or promote.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl MembershipPolicy for OpenPolicy {
    fn permits(&self, _issuer_role: Role, _action: Action) -> bool {
        true
    }
}

/// Members may invite and leave. Remove, promote and metadata edits need
/// `Admin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminPolicy;

impl MembershipPolicy for AdminPolicy {
    fn permits(&self, issuer_role: Role, action: Action) -> bool {
        match action {
            Action::Invite | Action::Leave => true,
            Action::Remove | Action::Promote | Action::SetMetadata => issuer_role == Role::Admin,
        }
    }
}

/// Serializable policy selector for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Open,
    Admin,
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn MembershipPolicy> {
        match self {
            PolicyKind::Open => Arc::new(OpenPolicy),
            PolicyKind::Admin => Arc::new(AdminPolicy),
        }
    }
}
