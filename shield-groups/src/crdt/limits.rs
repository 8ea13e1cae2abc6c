/// Membership log guardrails.
///
/// These constants bound op size, causal-context size and per-group log
/// growth so an authenticated but misbehaving member cannot exhaust a
/// mobile device.

/// Max encoded size of a single signed op.
pub const MAX_OP_BYTES: usize = 4 * 1024;

/// Max length of a device label carried by `Create` / `Invite`.
pub const MAX_DEVICE_LABEL_BYTES: usize = 128;

/// Max entries in an op's causal context. One per issuer, so this is also
/// the practical member ceiling.
pub const MAX_DEPS: usize = 1_024;

/// Max value size of one group metadata register (name, topic, avatar ref).
pub const MAX_METADATA_VALUE_BYTES: usize = 1_024;

/// Max encoded size of one reaction emoji.
pub const MAX_REACTION_BYTES: usize = 64;

/// Max plaintext size of one group message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64 KB

/// Max ops per group before the UI should warn.
pub const MAX_OPS_PER_GROUP: usize = 50_000;

/// Hard cap; further membership ops from peers are refused.
pub const HARD_CAP_OPS_PER_GROUP: usize = 100_000;

/// Max ops carried by one snapshot payload.
pub const MAX_OPS_PER_SNAPSHOT: usize = 2_048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLimitStatus {
    /// Under soft cap.
    Ok,
    /// Approaching the hard cap.
    NeedsCompaction,
    /// No more peer ops accepted.
    HardCapReached,
}

pub fn check_op_limits(op_count: usize) -> OpLimitStatus {
    if op_count >= HARD_CAP_OPS_PER_GROUP {
        OpLimitStatus::HardCapReached
    } else if op_count >= MAX_OPS_PER_GROUP {
        OpLimitStatus::NeedsCompaction
    } else {
        OpLimitStatus::Ok
    }
}
