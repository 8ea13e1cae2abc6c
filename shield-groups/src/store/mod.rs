//! Operation log store.
//!
//! Persists, per group, the op log, the message log, the sealed group key
//! and the outbound delivery queue. Logs are append-only and keyed by
//! `group_id || author || seq(BE)`, so a prefix scan returns one group in
//! author then sequence order.
//!
//! Backends implement the small raw key/value surface; the typed record
//! operations are provided on top of it. Values are CBOR.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::ids::{GroupId, MemberKey};
use crate::crdt::ops::SignedOp;
use crate::gateway::queue::OutboundDelivery;
use crate::message::MessageEnvelope;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conflicting record already stored at {0}")]
    Conflict(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("CBOR encoding failed: {0}")]
    Encode(String),
    #[error("CBOR decoding failed: {0}")]
    Decode(String),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tree {
    Groups,
    Ops,
    Messages,
    GroupKeys,
    Outbox,
    Meta,
}

impl Tree {
    pub const ALL: [Tree; 6] = [
        Tree::Groups,
        Tree::Ops,
        Tree::Messages,
        Tree::GroupKeys,
        Tree::Outbox,
        Tree::Meta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tree::Groups => "groups",
            Tree::Ops => "ops",
            Tree::Messages => "messages",
            Tree::GroupKeys => "group_keys",
            Tree::Outbox => "outbox",
            Tree::Meta => "meta",
        }
    }
}

/// `group_id || author || seq(BE)`
pub fn log_key(group_id: &GroupId, author: &MemberKey, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(72);
    key.extend_from_slice(group_id.as_bytes());
    key.extend_from_slice(author.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn outbox_key(group_id: &GroupId, id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(group_id.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

pub trait LogStore: Send + Sync {
    // ---- raw surface (backend implements) ----

    /// Insert if absent. Re-inserting identical bytes is a no-op; different
    /// bytes under an existing key is `StoreError::Conflict`.
    fn insert_unique(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()>;

    /// Insert or overwrite.
    fn put(&self, tree: Tree, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn remove(&self, tree: Tree, key: &[u8]) -> Result<()>;

    /// All entries under `prefix`, in key order.
    fn scan_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn remove_prefix(&self, tree: Tree, prefix: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    // ---- groups ----

    fn put_group(&self, group_id: &GroupId) -> Result<()> {
        self.put(Tree::Groups, group_id.as_bytes(), &[])
    }

    fn list_groups(&self) -> Result<Vec<GroupId>> {
        self.scan_prefix(Tree::Groups, &[])?
            .into_iter()
            .map(|(k, _)| {
                let bytes: [u8; 32] = k
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Decode("group key length".into()))?;
                Ok(GroupId(bytes))
            })
            .collect()
    }

    /// Drop everything stored for a group.
    fn delete_group(&self, group_id: &GroupId) -> Result<()> {
        let prefix = group_id.as_bytes();
        self.remove_prefix(Tree::Ops, prefix)?;
        self.remove_prefix(Tree::Messages, prefix)?;
        self.remove_prefix(Tree::Outbox, prefix)?;
        self.remove(Tree::GroupKeys, prefix)?;
        self.remove(Tree::Groups, prefix)?;
        self.flush()
    }

    // ---- op log ----

    fn append_op(&self, op: &SignedOp) -> Result<()> {
        let key = log_key(&op.group_id, &op.issuer, op.seq);
        self.insert_unique(Tree::Ops, &key, &cbor_encode(op)?)
            .map_err(|e| match e {
                StoreError::Conflict(_) => StoreError::Conflict(op.op_id().to_hex()),
                other => other,
            })
    }

    fn load_ops(&self, group_id: &GroupId) -> Result<Vec<SignedOp>> {
        self.scan_prefix(Tree::Ops, group_id.as_bytes())?
            .iter()
            .map(|(_, v)| cbor_decode(v))
            .collect()
    }

    // ---- message log ----

    fn append_message(&self, envelope: &MessageEnvelope) -> Result<()> {
        let key = log_key(&envelope.group_id, &envelope.sender, envelope.seq);
        self.insert_unique(Tree::Messages, &key, &cbor_encode(envelope)?)
    }

    fn load_messages(&self, group_id: &GroupId) -> Result<Vec<MessageEnvelope>> {
        self.scan_prefix(Tree::Messages, group_id.as_bytes())?
            .iter()
            .map(|(_, v)| cbor_decode(v))
            .collect()
    }

    // ---- sealed group key ----

    fn put_group_key(&self, group_id: &GroupId, sealed: &[u8]) -> Result<()> {
        self.put(Tree::GroupKeys, group_id.as_bytes(), sealed)?;
        self.flush()
    }

    fn load_group_key(&self, group_id: &GroupId) -> Result<Option<Vec<u8>>> {
        self.get(Tree::GroupKeys, group_id.as_bytes())
    }

    // ---- outbound queue ----

    fn put_outbound(&self, delivery: &OutboundDelivery) -> Result<()> {
        self.put(
            Tree::Outbox,
            &outbox_key(&delivery.group_id, &delivery.id),
            &cbor_encode(delivery)?,
        )
    }

    fn remove_outbound(&self, group_id: &GroupId, id: &Uuid) -> Result<()> {
        self.remove(Tree::Outbox, &outbox_key(group_id, id))
    }

    fn load_outbound(&self) -> Result<Vec<OutboundDelivery>> {
        self.scan_prefix(Tree::Outbox, &[])?
            .iter()
            .map(|(_, v)| cbor_decode(v))
            .collect()
    }

    // ---- metadata ----

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get(Tree::Meta, key.as_bytes())
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put(Tree::Meta, key.as_bytes(), value)
    }
}

// ---------------------------------------------------------------------------
// Shared backend tests
// ---------------------------------------------------------------------------
