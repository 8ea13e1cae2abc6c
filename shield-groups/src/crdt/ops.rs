/// Signed membership operations.
///
/// Every membership change is an immutable op signed by its issuer. Ops
/// carry their causal context (`deps`) so validity can be judged against
/// exactly what the issuer had seen, which is the same on every replica.
///
/// - Wire / storage form: bincode (deterministic, compact)
/// - Signing: Ed25519 over BLAKE3(bincode(all fields except signature))
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crdt::ids::{GroupId, MemberKey, OpId};
use crate::crdt::limits::{MAX_DEPS, MAX_DEVICE_LABEL_BYTES, MAX_METADATA_VALUE_BYTES, MAX_OP_BYTES};
use crate::crdt::metadata::MetadataKey;
use crate::crypto::signing;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("Invalid signature")]
    SignatureInvalid,

    #[error("Op belongs to group {got:?}, expected {expected:?}")]
    WrongGroup { expected: GroupId, got: GroupId },

    /// The op is held until `issuer` reaches `need`.
    #[error("Sequence gap for {issuer:?}: have {have}, need {need}")]
    SequenceGap {
        issuer: MemberKey,
        have: u64,
        need: u64,
    },

    /// Nothing is known yet about the issuer (or the group itself).
    #[error("Unknown issuer {0:?}")]
    UnknownIssuer(MemberKey),

    #[error("Equivocation: {0:?} already applied with different content")]
    Equivocation(OpId),

    #[error("Malformed op: {0}")]
    Malformed(String),

    #[error("Op exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Hold buffer full")]
    HoldBufferFull,

    #[error("Group op log hard cap reached")]
    HardCapReached,

    #[error("Bincode serialization failed: {0}")]
    Bincode(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

impl OpError {
    /// Held errors are retried automatically; everything else is final.
    pub fn is_held(&self) -> bool {
        matches!(self, OpError::SequenceGap { .. } | OpError::UnknownIssuer(_))
    }
}

// ---------------------------------------------------------------------------
// Role / OpKind
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Member = 0,
    Admin = 1,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Genesis. Only valid as the creator's seq 1 with
    /// `group_id == GroupId::new(issuer, group_nonce)`.
    Create {
        group_nonce: [u8; 32],
        encryption_pubkey: [u8; 32],
        device: String,
    },
    Invite {
        target: MemberKey,
        device: String,
    },
    /// Issued by the invitee. Publishes the X25519 key the group key is
    /// wrapped to.
    Accept { encryption_pubkey: [u8; 32] },
    /// `target == issuer` is a leave.
    Remove { target: MemberKey },
    Promote { target: MemberKey },
    /// Last-writer-wins group property.
    SetMetadata { key: MetadataKey, value: Vec<u8> },
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "Create",
            OpKind::Invite { .. } => "Invite",
            OpKind::Accept { .. } => "Accept",
            OpKind::Remove { .. } => "Remove",
            OpKind::Promote { .. } => "Promote",
            OpKind::SetMetadata { .. } => "SetMetadata",
        }
    }

    /// The member this op is about, if not the issuer.
    pub fn target(&self) -> Option<&MemberKey> {
        match self {
            OpKind::Invite { target, .. }
            | OpKind::Remove { target }
            | OpKind::Promote { target } => Some(target),
            OpKind::Create { .. } | OpKind::Accept { .. } | OpKind::SetMetadata { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SignedOp
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedOp {
    pub group_id: GroupId,
    pub issuer: MemberKey,
    /// Per-issuer counter, starting at 1.
    pub seq: u64,
    /// Highest contiguous seq the issuer had applied from each *other*
    /// issuer. Its own `seq - 1` is implied.
    pub deps: BTreeMap<MemberKey, u64>,
    /// Wall clock, display only.
    pub timestamp_ms: u64,
    pub kind: OpKind,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignedOp {
    /// Build and sign an op. The issuer key is derived from `signing_key`.
    pub fn create_signed(
        group_id: GroupId,
        kind: OpKind,
        seq: u64,
        deps: BTreeMap<MemberKey, u64>,
        signing_key: &[u8; 32],
    ) -> Result<Self, OpError> {
        let issuer = signing::derive_public_key(signing_key)
            .map_err(|e| OpError::SigningFailed(e.to_string()))?;

        let mut op = SignedOp {
            group_id,
            issuer: MemberKey(issuer),
            seq,
            deps,
            timestamp_ms: now_ms(),
            kind,
            signature: [0u8; 64],
        };
        op.check_shape()?;

        let hash = blake3::hash(&op.signable_bytes()?);
        op.signature = signing::sign_data(hash.as_bytes(), signing_key)
            .map_err(|e| OpError::SigningFailed(e.to_string()))?;
        Ok(op)
    }

    pub fn op_id(&self) -> OpId {
        OpId::new(self.issuer, self.seq)
    }

    /// Verify the issuer's signature.
    pub fn verify(&self) -> Result<bool, OpError> {
        let hash = blake3::hash(&self.signable_bytes()?);
        signing::verify_signature(hash.as_bytes(), &self.signature, &self.issuer.0)
            .map_err(|e| OpError::SigningFailed(e.to_string()))
    }

    /// Structural checks that need no group state.
    pub fn check_shape(&self) -> Result<(), OpError> {
        if self.seq == 0 {
            return Err(OpError::Malformed("seq must start at 1".into()));
        }
        if self.deps.len() > MAX_DEPS {
            return Err(OpError::Malformed(format!(
                "{} deps exceeds {}",
                self.deps.len(),
                MAX_DEPS
            )));
        }
        if self.deps.contains_key(&self.issuer) {
            return Err(OpError::Malformed("deps must not name the issuer".into()));
        }
        if self.deps.values().any(|s| *s == 0) {
            return Err(OpError::Malformed("zero dep entry".into()));
        }
        match &self.kind {
            OpKind::Create {
                group_nonce,
                device,
                ..
            } => {
                if self.seq != 1 || !self.deps.is_empty() {
                    return Err(OpError::Malformed("Create must be seq 1 with no deps".into()));
                }
                if GroupId::new(&self.issuer, group_nonce) != self.group_id {
                    return Err(OpError::Malformed("Create not bound to group id".into()));
                }
                check_label(device)?;
            }
            OpKind::Invite { target, device } => {
                if *target == self.issuer {
                    return Err(OpError::Malformed("self-invite".into()));
                }
                check_label(device)?;
            }
            OpKind::Promote { target } if *target == self.issuer => {
                return Err(OpError::Malformed("self-promote".into()));
            }
            OpKind::SetMetadata { value, .. } if value.len() > MAX_METADATA_VALUE_BYTES => {
                return Err(OpError::TooLarge {
                    size: value.len(),
                    max: MAX_METADATA_VALUE_BYTES,
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// True if `id` is in this op's causal past.
    pub fn has_seen(&self, id: &OpId) -> bool {
        if id.issuer == self.issuer {
            id.seq < self.seq
        } else {
            self.deps.get(&id.issuer).is_some_and(|s| *s >= id.seq)
        }
    }

    /// Content hash over the full encoding, used to tell a re-delivery
    /// from an equivocation.
    pub fn digest(&self) -> Result<[u8; 32], OpError> {
        Ok(*blake3::hash(&self.to_bytes()?).as_bytes())
    }

    fn signable_bytes(&self) -> Result<Vec<u8>, OpError> {
        let signable = (
            &self.group_id,
            &self.issuer,
            self.seq,
            &self.deps,
            self.timestamp_ms,
            &self.kind,
        );
        bincode::serialize(&signable).map_err(|e| OpError::Bincode(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OpError> {
        bincode::serialize(self).map_err(|e| OpError::Bincode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OpError> {
        if bytes.len() > MAX_OP_BYTES {
            return Err(OpError::TooLarge {
                size: bytes.len(),
                max: MAX_OP_BYTES,
            });
        }
        bincode::deserialize(bytes).map_err(|e| OpError::Bincode(e.to_string()))
    }
}

fn check_label(label: &str) -> Result<(), OpError> {
    if label.len() > MAX_DEVICE_LABEL_BYTES {
        return Err(OpError::TooLarge {
            size: label.len(),
            max: MAX_DEVICE_LABEL_BYTES,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing::generate_keypair;

    fn genesis(privkey: &[u8; 32], pubkey: &[u8; 32]) -> SignedOp {
        let nonce = [0xAA; 32];
        let gid = GroupId::new(&MemberKey(*pubkey), &nonce);
        SignedOp::create_signed(
            gid,
            OpKind::Create {
                group_nonce: nonce,
                encryption_pubkey: [9u8; 32],
                device: "phone".into(),
            },
            1,
            BTreeMap::new(),
            privkey,
        )
        .unwrap()
    }

    #[test]
    fn test_create_signed_and_verify() {
        let (pubkey, privkey) = generate_keypair();
        let op = genesis(&privkey, &pubkey);
        assert_eq!(op.issuer.0, pubkey);
        assert!(op.verify().unwrap());
    }

    #[test]
    fn test_tampered_op_fails_verification() {
        let (pubkey, privkey) = generate_keypair();
        let mut op = genesis(&privkey, &pubkey);
        op.timestamp_ms += 1;
        assert!(!op.verify().unwrap());
    }

    #[test]
    fn test_create_must_bind_group_id() {
        let (_, privkey) = generate_keypair();
        let err = SignedOp::create_signed(
            GroupId([1u8; 32]),
            OpKind::Create {
                group_nonce: [0u8; 32],
                encryption_pubkey: [0u8; 32],
                device: String::new(),
            },
            1,
            BTreeMap::new(),
            &privkey,
        )
        .unwrap_err();
        assert!(matches!(err, OpError::Malformed(_)));
    }

    #[test]
    fn test_deps_must_not_name_issuer() {
        let (pubkey, privkey) = generate_keypair();
        let mut deps = BTreeMap::new();
        deps.insert(MemberKey(pubkey), 1);
        let err = SignedOp::create_signed(
            GroupId([1u8; 32]),
            OpKind::Accept {
                encryption_pubkey: [0u8; 32],
            },
            2,
            deps,
            &privkey,
        )
        .unwrap_err();
        assert!(matches!(err, OpError::Malformed(_)));
    }

    #[test]
    fn test_oversized_metadata_value_rejected() {
        let (_, privkey) = generate_keypair();
        let err = SignedOp::create_signed(
            GroupId([1u8; 32]),
            OpKind::SetMetadata {
                key: MetadataKey::Topic,
                value: vec![b'x'; MAX_METADATA_VALUE_BYTES + 1],
            },
            2,
            BTreeMap::new(),
            &privkey,
        )
        .unwrap_err();
        assert!(matches!(err, OpError::TooLarge { .. }));
    }

    #[test]
    fn test_has_seen() {
        let (pubkey, privkey) = generate_keypair();
        let other = MemberKey([3u8; 32]);
        let mut deps = BTreeMap::new();
        deps.insert(other, 4);
        let op = SignedOp::create_signed(
            GroupId([1u8; 32]),
            OpKind::Accept {
                encryption_pubkey: [0u8; 32],
            },
            3,
            deps,
            &privkey,
        )
        .unwrap();

        assert!(op.has_seen(&OpId::new(MemberKey(pubkey), 2)));
        assert!(!op.has_seen(&OpId::new(MemberKey(pubkey), 3)));
        assert!(op.has_seen(&OpId::new(other, 4)));
        assert!(!op.has_seen(&OpId::new(other, 5)));
        assert!(!op.has_seen(&OpId::new(MemberKey([4u8; 32]), 1)));
    }

    #[test]
    fn test_bytes_roundtrip_and_digest() {
        let (pubkey, privkey) = generate_keypair();
        let op = genesis(&privkey, &pubkey);
        let decoded = SignedOp::from_bytes(&op.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, op);
        assert!(decoded.verify().unwrap());
        assert_eq!(decoded.digest().unwrap(), op.digest().unwrap());
    }

    #[test]
    fn test_oversized_bytes_rejected() {
        let junk = vec![0u8; MAX_OP_BYTES + 1];
        assert!(matches!(
            SignedOp::from_bytes(&junk),
            Err(OpError::TooLarge { .. })
        ));
    }
}
