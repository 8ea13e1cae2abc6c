/// Identity types for the group membership log.
///
/// - `MemberKey`: a member's Ed25519 signing public key
/// - `GroupId`: 32-byte group identifier bound to its creator
/// - `OpId`: `(issuer, seq)`, the deterministic tie-break order
/// - `MessageId`: `(sender, seq)`, the message dedup key

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// MemberKey
// ---------------------------------------------------------------------------

/// A member's Ed25519 verifying key. The hex form is the member fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberKey(pub [u8; 32]);

impl MemberKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MemberKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex fingerprint.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(MemberKey(key))
    }
}

impl Ord for MemberKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for MemberKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberKey({})", self.short())
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Group identifier: BLAKE3("SG-GROUP" || creator_key || random32).
///
/// Binding the creator key into the id means a `Create` op can be checked
/// against the id it claims without any outside registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    pub fn new(creator: &MemberKey, random: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"SG-GROUP");
        hasher.update(&creator.0);
        hasher.update(random);
        GroupId(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(GroupId(id))
    }
}

impl Ord for GroupId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for GroupId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// OpId / MessageId
// ---------------------------------------------------------------------------

/// Operation identifier. Ordered by `(issuer, seq)`; the larger id wins
/// every last-writer tie-break in the membership state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub issuer: MemberKey,
    pub seq: u64,
}

impl OpId {
    pub fn new(issuer: MemberKey, seq: u64) -> Self {
        OpId { issuer, seq }
    }

    /// Format: `{issuer_hex}:{seq_hex}`
    pub fn to_hex(&self) -> String {
        format!("{}:{:016x}", self.issuer.fingerprint(), self.seq)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({}, #{})", self.issuer.short(), self.seq)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct MessageId {
    pub sender: MemberKey,
    pub seq: u64,
}

impl MessageId {
    pub fn new(sender: MemberKey, seq: u64) -> Self {
        MessageId { sender, seq }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
