//! Sync / broadcast gateway: wire format and transport seam.
//!
//! The only thing the core asks of the network is "send these bytes to
//! member X" ([`Transport`]). Everything on the wire is a bincode
//! [`WirePayload`]. Delivery is driven by the persisted [`queue`] and the
//! tokio [`scheduler`]; inbound bytes enter through
//! `GroupManager::ingest`.

pub mod dedupe;
pub mod queue;
pub mod scheduler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crdt::ids::{GroupId, MemberKey};
use crate::crdt::limits::{MAX_OPS_PER_SNAPSHOT, MAX_OP_BYTES};
use crate::crdt::ops::{now_ms, SignedOp};
use crate::crypto::signing;
use crate::group_key::EncryptedKeyBlob;
use crate::message::MessageEnvelope;

pub use dedupe::DedupeCache;
pub use queue::{DeliveryQueue, OutboundDelivery};
pub use scheduler::DeliveryScheduler;

/// Max size of one inbound payload: a full snapshot chunk plus framing.
pub const MAX_WIRE_BYTES: usize = MAX_OPS_PER_SNAPSHOT * MAX_OP_BYTES + 64 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Peer rejected delivery: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Payload too large ({size} > {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Bincode serialization failed: {0}")]
    Bincode(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Outbound side of the anonymity network. Called only from
/// `GroupManager::flush_outbox`, never under a group lock, so an
/// implementation may hand bytes straight to another local manager.
pub trait Transport: Send + Sync {
    fn send_to_member(&self, member: &MemberKey, bytes: &[u8]) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Signed control payloads
// ---------------------------------------------------------------------------

fn sign_fields<T: Serialize>(fields: &T, signing_key: &[u8; 32]) -> Result<[u8; 64], WireError> {
    let bytes = bincode::serialize(fields).map_err(|e| WireError::Bincode(e.to_string()))?;
    signing::sign_data(blake3::hash(&bytes).as_bytes(), signing_key)
        .map_err(|e| WireError::SigningFailed(e.to_string()))
}

fn verify_fields<T: Serialize>(fields: &T, signature: &[u8; 64], signer: &MemberKey) -> bool {
    let Ok(bytes) = bincode::serialize(fields) else {
        return false;
    };
    signing::verify_signature(blake3::hash(&bytes).as_bytes(), signature, &signer.0)
        .unwrap_or(false)
}

/// A group key wrapped for one member, signed by the member who wrapped it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyDelivery {
    pub group_id: GroupId,
    pub sender: MemberKey,
    pub recipient: MemberKey,
    pub blob: EncryptedKeyBlob,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl KeyDelivery {
    pub fn create_signed(
        group_id: GroupId,
        sender: MemberKey,
        recipient: MemberKey,
        blob: EncryptedKeyBlob,
        signing_key: &[u8; 32],
    ) -> Result<Self, WireError> {
        let signature = sign_fields(&(&group_id, &sender, &recipient, &blob), signing_key)?;
        Ok(KeyDelivery {
            group_id,
            sender,
            recipient,
            blob,
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        verify_fields(
            &(&self.group_id, &self.sender, &self.recipient, &self.blob),
            &self.signature,
            &self.sender,
        )
    }
}

/// "I hold the group key." Broadcast so every key holder stops re-sending.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyAck {
    pub group_id: GroupId,
    pub member: MemberKey,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl KeyAck {
    pub fn create_signed(
        group_id: GroupId,
        member: MemberKey,
        signing_key: &[u8; 32],
    ) -> Result<Self, WireError> {
        let signature = sign_fields(&(b"ack", &group_id, &member), signing_key)?;
        Ok(KeyAck {
            group_id,
            member,
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        verify_fields(
            &(b"ack", &self.group_id, &self.member),
            &self.signature,
            &self.member,
        )
    }
}

/// Request for every op past the sender's frontier.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResyncRequest {
    pub group_id: GroupId,
    pub from: MemberKey,
    pub have: BTreeMap<MemberKey, u64>,
    /// Keeps repeated requests from the same frontier distinct on the wire.
    pub requested_ms: u64,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl ResyncRequest {
    pub fn create_signed(
        group_id: GroupId,
        from: MemberKey,
        have: BTreeMap<MemberKey, u64>,
        signing_key: &[u8; 32],
    ) -> Result<Self, WireError> {
        let requested_ms = now_ms();
        let signature = sign_fields(
            &(b"resync", &group_id, &from, &have, requested_ms),
            signing_key,
        )?;
        Ok(ResyncRequest {
            group_id,
            from,
            have,
            requested_ms,
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        verify_fields(
            &(
                b"resync",
                &self.group_id,
                &self.from,
                &self.have,
                self.requested_ms,
            ),
            &self.signature,
            &self.from,
        )
    }
}

// ---------------------------------------------------------------------------
// WirePayload
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum WirePayload {
    Op(SignedOp),
    Message(MessageEnvelope),
    KeyDelivery(KeyDelivery),
    KeyAck(KeyAck),
    ResyncRequest(ResyncRequest),
    /// Chunk `part` of `parts` of a group history, ops in admission
    /// order. Each op carries its own signature.
    Snapshot {
        group_id: GroupId,
        part: u32,
        parts: u32,
        ops: Vec<SignedOp>,
    },
}

impl WirePayload {
    pub fn group_id(&self) -> &GroupId {
        match self {
            WirePayload::Op(op) => &op.group_id,
            WirePayload::Message(env) => &env.group_id,
            WirePayload::KeyDelivery(d) => &d.group_id,
            WirePayload::KeyAck(a) => &a.group_id,
            WirePayload::ResyncRequest(r) => &r.group_id,
            WirePayload::Snapshot { group_id, .. } => group_id,
        }
    }

    /// Claimed author, used as the dedup namespace.
    pub fn author(&self) -> [u8; 32] {
        match self {
            WirePayload::Op(op) => op.issuer.0,
            WirePayload::Message(env) => env.sender.0,
            WirePayload::KeyDelivery(d) => d.sender.0,
            WirePayload::KeyAck(a) => a.member.0,
            WirePayload::ResyncRequest(r) => r.from.0,
            WirePayload::Snapshot { ops, .. } => {
                ops.first().map(|op| op.issuer.0).unwrap_or([0u8; 32])
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WirePayload::Op(_) => "op",
            WirePayload::Message(_) => "message",
            WirePayload::KeyDelivery(_) => "key_delivery",
            WirePayload::KeyAck(_) => "key_ack",
            WirePayload::ResyncRequest(_) => "resync_request",
            WirePayload::Snapshot { .. } => "snapshot",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serialize(self).map_err(|e| WireError::Bincode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_WIRE_BYTES {
            return Err(WireError::TooLarge {
                size: bytes.len(),
                max: MAX_WIRE_BYTES,
            });
        }
        bincode::deserialize(bytes).map_err(|e| WireError::Bincode(e.to_string()))
    }
}
