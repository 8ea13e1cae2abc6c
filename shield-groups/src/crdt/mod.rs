pub mod apply;
/// Group membership CRDT: operation-based, causally delivered.
///
/// A group is an append-only log of signed membership ops (create, invite,
/// accept, remove, promote). Each op carries the causal context it was
/// issued in; replicas admit ops in causal order and judge each one against
/// that context, so every device converges on the same membership.
///
/// # Module structure
/// - `ids`: MemberKey, GroupId, OpId, MessageId identity types
/// - `ops`: SignedOp, OpKind, Role, signing/verification
/// - `limits`: Guardrail constants and op limit checking
/// - `policy`: Pluggable authorization (open / admin-only)
/// - `membership`: Member records, causal-view validity, commutative effects
/// - `metadata`: LWW registers for group name, topic and avatar
/// - `apply`: Apply engine (GroupState, hold buffer, materialize, state_hash)
pub mod ids;
pub mod limits;
pub mod membership;
pub mod metadata;
pub mod ops;
pub mod policy;

// Re-export core types for convenience
pub use apply::{AppliedOp, GroupState, HoldLimits, MembershipDelta, OpEffect};
pub use ids::{GroupId, MemberKey, MessageId, OpId};
pub use limits::{check_op_limits, OpLimitStatus};
pub use membership::{IgnoreReason, MemberChange, MemberRecord, MembershipState};
pub use metadata::{LwwRegister, MetadataKey, MetadataState};
pub use ops::{now_ms, OpError, OpKind, Role, SignedOp};
pub use policy::{Action, AdminPolicy, MembershipPolicy, OpenPolicy, PolicyKind};
