//! Shield Groups: serverless group membership and encrypted group chat.
//!
//! Every device keeps a replica of each group's signed op log and
//! converges on the same membership without a coordinator. Content is
//! sealed with a shared group key that is wrapped per member.
//!
//! # Modules
//! - `crypto`: Ed25519, X25519, XChaCha20-Poly1305, HKDF, Argon2id
//! - `crdt`: membership ops, causal apply engine, policies
//! - `group_key`: group key wrap/unwrap, at-rest vault, delivery tracking
//! - `message`: encrypted message envelopes and the per-group message log
//! - `store`: op/message/key/outbox persistence (memory and sled)
//! - `gateway`: wire format, transport seam, outbox, dedupe, scheduler
//! - `manager`: `GroupManager`, the entry point for embedders

#![allow(clippy::too_many_arguments, clippy::type_complexity)]

// ── Core ────────────────────────────────────────────────────────────────────
pub mod config;
pub mod crdt;
pub mod crypto;
pub mod error;
pub mod group_key;
pub mod message;
pub mod store;

// ── Device runtime ──────────────────────────────────────────────────────────
pub mod events;
pub mod gateway;
pub mod identity;
pub mod manager;

// ── Re-export main types ────────────────────────────────────────────────────
pub use config::{GroupConfig, RetryPolicy};
pub use crdt::{GroupId, MemberKey, MemberRecord, MessageId, OpId, PolicyKind, Role};
pub use error::{GroupError, Result};
pub use events::{GroupEvent, UserNotice};
pub use gateway::{DeliveryScheduler, Transport, TransportError, WirePayload};
pub use identity::{IdentityProvider, StaticIdentity};
pub use manager::{FlushReport, GroupManager, IngestOutcome};
pub use message::{MessageBody, MessageView, SystemNotice};
pub use store::{LogStore, MemoryStore, SledStore};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!get_version().is_empty());
    }
}
