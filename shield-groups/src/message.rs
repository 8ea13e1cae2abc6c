//! Group message codec and message log.
//!
//! Messages travel as a signed [`MessageEnvelope`]. The body is either a
//! cleartext [`SystemNotice`] or content sealed under the group key with
//! XChaCha20-Poly1305, the header (`group_id || sender || seq`) bound as
//! associated data. Records are stored as received and decrypted when
//! queried, so a key that arrives late makes earlier messages readable.
//!
//! Edits, deletes and reactions are envelopes of their own that name a
//! target message. Rendering folds them over the log, so the result does
//! not depend on arrival order:
//! - only the author may edit, and the highest-seq edit wins
//! - the author or an admin may delete, leaving a tombstone
//! - each `(reactor, emoji)` follows the reactor's highest-seq reaction

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crdt::ids::{GroupId, MemberKey, MessageId};
use crate::crdt::limits::{MAX_MESSAGE_BYTES, MAX_REACTION_BYTES};
use crate::crdt::membership::MembershipState;
use crate::crdt::ops::{now_ms, Role};
use crate::crypto::encryption::{self, EncryptionError, NONCE_SIZE};
use crate::crypto::signing;
use crate::group_key::GroupKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Invalid signature")]
    SignatureInvalid,
    #[error("Message {0:?} already stored with different content")]
    Conflict(MessageId),
    #[error("Message too large ({size} > {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Bincode serialization failed: {0}")]
    Bincode(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Unknown target message {0:?}")]
    UnknownTarget(MessageId),
    #[error("Not permitted to change message {0:?}")]
    NotPermitted(MessageId),
    #[error("Invalid reaction")]
    InvalidReaction,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    #[error("No group key")]
    NoKey,
    #[error("Decryption failure")]
    DecryptionFailure,
    #[error("Not an encrypted message")]
    NotContent,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SystemNotice {
    MemberJoined(MemberKey),
    MemberLeft(MemberKey),
    MemberRemoved(MemberKey),
    Text(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum EncryptedMessage {
    /// Cleartext, still signed.
    System(SystemNotice),
    Content {
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
    },
    /// New text for one of the sender's own messages.
    Edit {
        target: MessageId,
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
    },
    Delete {
        target: MessageId,
    },
    /// Sealed emoji. `present: false` withdraws an earlier reaction.
    Reaction {
        target: MessageId,
        present: bool,
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
    },
}

impl EncryptedMessage {
    /// The message this one annotates, if it is an edit, delete or reaction.
    pub fn target(&self) -> Option<&MessageId> {
        match self {
            EncryptedMessage::Edit { target, .. }
            | EncryptedMessage::Delete { target }
            | EncryptedMessage::Reaction { target, .. } => Some(target),
            EncryptedMessage::System(_) | EncryptedMessage::Content { .. } => None,
        }
    }

    fn sealed(&self) -> Option<(&[u8; NONCE_SIZE], &[u8])> {
        match self {
            EncryptedMessage::Content { nonce, ciphertext }
            | EncryptedMessage::Edit {
                nonce, ciphertext, ..
            }
            | EncryptedMessage::Reaction {
                nonce, ciphertext, ..
            } => Some((nonce, ciphertext.as_slice())),
            EncryptedMessage::System(_) | EncryptedMessage::Delete { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub group_id: GroupId,
    pub sender: MemberKey,
    /// Per-sender counter, starting at 1.
    pub seq: u64,
    pub timestamp_ms: u64,
    pub body: EncryptedMessage,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

/// Associated data binding a ciphertext to its header.
pub fn header_aad(group_id: &GroupId, sender: &MemberKey, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(72);
    aad.extend_from_slice(group_id.as_bytes());
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

/// Seal `plaintext` for the given header. The nonce is generated here.
fn seal(
    key: &GroupKey,
    group_id: &GroupId,
    sender: &MemberKey,
    seq: u64,
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), MessageError> {
    if plaintext.len() > MAX_MESSAGE_BYTES {
        return Err(MessageError::TooLarge {
            size: plaintext.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    encryption::seal(
        key.as_bytes(),
        plaintext,
        &header_aad(group_id, sender, seq),
    )
    .map_err(|_| MessageError::EncryptionFailed)
}

pub fn encrypt(
    key: &GroupKey,
    group_id: &GroupId,
    sender: &MemberKey,
    seq: u64,
    plaintext: &[u8],
) -> Result<EncryptedMessage, MessageError> {
    let (nonce, ciphertext) = seal(key, group_id, sender, seq, plaintext)?;
    Ok(EncryptedMessage::Content { nonce, ciphertext })
}

pub fn encrypt_edit(
    key: &GroupKey,
    group_id: &GroupId,
    sender: &MemberKey,
    seq: u64,
    target: MessageId,
    plaintext: &[u8],
) -> Result<EncryptedMessage, MessageError> {
    let (nonce, ciphertext) = seal(key, group_id, sender, seq, plaintext)?;
    Ok(EncryptedMessage::Edit {
        target,
        nonce,
        ciphertext,
    })
}

pub fn encrypt_reaction(
    key: &GroupKey,
    group_id: &GroupId,
    sender: &MemberKey,
    seq: u64,
    target: MessageId,
    emoji: &str,
    present: bool,
) -> Result<EncryptedMessage, MessageError> {
    if emoji.is_empty() || emoji.len() > MAX_REACTION_BYTES {
        return Err(MessageError::InvalidReaction);
    }
    let (nonce, ciphertext) = seal(key, group_id, sender, seq, emoji.as_bytes())?;
    Ok(EncryptedMessage::Reaction {
        target,
        present,
        nonce,
        ciphertext,
    })
}

/// Open the sealed part of a content, edit or reaction body.
pub fn decrypt(key: &GroupKey, envelope: &MessageEnvelope) -> Result<Vec<u8>, DecryptError> {
    let Some((nonce, ciphertext)) = envelope.body.sealed() else {
        return Err(DecryptError::NotContent);
    };
    encryption::open(
        key.as_bytes(),
        nonce,
        ciphertext,
        &header_aad(&envelope.group_id, &envelope.sender, envelope.seq),
    )
    .map_err(|e| match e {
        EncryptionError::InvalidKeyLength => DecryptError::NoKey,
        _ => DecryptError::DecryptionFailure,
    })
}

impl MessageEnvelope {
    pub fn create_signed(
        group_id: GroupId,
        seq: u64,
        body: EncryptedMessage,
        signing_key: &[u8; 32],
    ) -> Result<Self, MessageError> {
        Self::create_signed_at(group_id, seq, now_ms(), body, signing_key)
    }

    pub fn create_signed_at(
        group_id: GroupId,
        seq: u64,
        timestamp_ms: u64,
        body: EncryptedMessage,
        signing_key: &[u8; 32],
    ) -> Result<Self, MessageError> {
        let sender = signing::derive_public_key(signing_key)
            .map_err(|e| MessageError::SigningFailed(e.to_string()))?;
        let mut envelope = MessageEnvelope {
            group_id,
            sender: MemberKey(sender),
            seq,
            timestamp_ms,
            body,
            signature: [0u8; 64],
        };
        let hash = blake3::hash(&envelope.signable_bytes()?);
        envelope.signature = signing::sign_data(hash.as_bytes(), signing_key)
            .map_err(|e| MessageError::SigningFailed(e.to_string()))?;
        Ok(envelope)
    }

    pub fn id(&self) -> MessageId {
        MessageId::new(self.sender, self.seq)
    }

    pub fn verify(&self) -> bool {
        let Ok(signable) = self.signable_bytes() else {
            return false;
        };
        let hash = blake3::hash(&signable);
        signing::verify_signature(hash.as_bytes(), &self.signature, &self.sender.0)
            .unwrap_or(false)
    }

    fn signable_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let signable = (
            &self.group_id,
            &self.sender,
            self.seq,
            self.timestamp_ms,
            &self.body,
        );
        bincode::serialize(&signable).map_err(|e| MessageError::Bincode(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::Bincode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(|e| MessageError::Bincode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Rendered view
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Content(Vec<u8>),
    /// Key missing or ciphertext rejected. Retried on every query.
    Unreadable,
    System(SystemNotice),
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub sender: MemberKey,
    pub timestamp_ms: u64,
    pub body: MessageBody,
    pub edited: bool,
    /// Emoji to the members currently reacting with it.
    pub reactions: BTreeMap<String, Vec<MemberKey>>,
}

// ---------------------------------------------------------------------------
// MessageLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Verified envelopes of one group, keyed by `(sender, seq)`.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    entries: BTreeMap<MessageId, MessageEnvelope>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify and store. The same `(sender, seq)` with other content is a
    /// conflict and is refused.
    pub fn insert(&mut self, envelope: MessageEnvelope) -> Result<InsertOutcome, MessageError> {
        if !envelope.verify() {
            return Err(MessageError::SignatureInvalid);
        }
        let id = envelope.id();
        if let Some(existing) = self.entries.get(&id) {
            return if *existing == envelope {
                Ok(InsertOutcome::Duplicate)
            } else {
                Err(MessageError::Conflict(id))
            };
        }
        self.entries.insert(id, envelope);
        Ok(InsertOutcome::Inserted)
    }

    pub fn get(&self, id: &MessageId) -> Option<&MessageEnvelope> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_seq(&self, sender: &MemberKey) -> u64 {
        self.entries
            .range(MessageId::new(*sender, 0)..=MessageId::new(*sender, u64::MAX))
            .next_back()
            .map(|(id, _)| id.seq + 1)
            .unwrap_or(1)
    }

    /// Check that `actor` may edit or delete `target` before signing.
    pub fn check_change(
        &self,
        target: &MessageId,
        actor: &MemberKey,
        delete: bool,
        membership: &MembershipState,
    ) -> Result<(), MessageError> {
        let env = self
            .entries
            .get(target)
            .filter(|env| env.body.target().is_none())
            .ok_or(MessageError::UnknownTarget(*target))?;
        let permitted = if delete {
            may_delete(env, actor, membership)
        } else {
            may_edit(env, actor)
        };
        if permitted {
            Ok(())
        } else {
            Err(MessageError::NotPermitted(*target))
        }
    }

    /// True if `target` is a message that reactions can attach to.
    pub fn is_base(&self, target: &MessageId) -> bool {
        self.entries
            .get(target)
            .is_some_and(|env| env.body.target().is_none())
    }

    /// Render in `(timestamp, sender, seq)` order, decrypting with `key`.
    ///
    /// Senders that were never accepted into the group stay hidden until a
    /// membership change reveals them. Messages a removed member stamped
    /// after their removal stay hidden.
    pub fn render(&self, key: Option<&GroupKey>, membership: &MembershipState) -> Vec<MessageView> {
        let mut notes: BTreeMap<MessageId, Annotations> = BTreeMap::new();
        for env in self.entries.values() {
            self.annotate(&mut notes, env, key, membership);
        }
        let mut views: Vec<MessageView> = self
            .entries
            .values()
            .filter(|env| env.body.target().is_none() && is_visible(env, membership))
            .map(|env| view_of(env, key, notes.get(&env.id())))
            .collect();
        views.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        views
    }

    /// Render one message, or `None` if it is unknown or hidden.
    pub fn render_one(
        &self,
        id: &MessageId,
        key: Option<&GroupKey>,
        membership: &MembershipState,
    ) -> Option<MessageView> {
        let env = self
            .entries
            .get(id)
            .filter(|env| env.body.target().is_none() && is_visible(env, membership))?;
        let mut notes = BTreeMap::new();
        for other in self
            .entries
            .values()
            .filter(|other| other.body.target() == Some(id))
        {
            self.annotate(&mut notes, other, key, membership);
        }
        Some(view_of(env, key, notes.get(id)))
    }

    fn annotate<'a>(
        &'a self,
        notes: &mut BTreeMap<MessageId, Annotations<'a>>,
        env: &'a MessageEnvelope,
        key: Option<&GroupKey>,
        membership: &MembershipState,
    ) {
        let Some(target_id) = env.body.target() else {
            return;
        };
        if !is_visible(env, membership) {
            return;
        }
        let Some(target) = self
            .entries
            .get(target_id)
            .filter(|t| t.body.target().is_none())
        else {
            return;
        };
        let note = notes.entry(*target_id).or_default();
        match &env.body {
            EncryptedMessage::Edit { .. } if may_edit(target, &env.sender) => {
                if note.edit.map_or(true, |e| e.seq < env.seq) {
                    note.edit = Some(env);
                }
            }
            EncryptedMessage::Delete { .. } if may_delete(target, &env.sender, membership) => {
                note.deleted = true;
            }
            EncryptedMessage::Reaction { present, .. } => {
                let Some(emoji) = key
                    .and_then(|k| decrypt(k, env).ok())
                    .and_then(|raw| String::from_utf8(raw).ok())
                    .filter(|e| !e.is_empty() && e.len() <= MAX_REACTION_BYTES)
                else {
                    return;
                };
                let slot = note
                    .reactions
                    .entry((emoji, env.sender))
                    .or_insert((env.seq, *present));
                if slot.0 < env.seq {
                    *slot = (env.seq, *present);
                }
            }
            _ => {}
        }
    }
}

/// Edits, deletes and reactions that apply to one base message.
#[derive(Default)]
struct Annotations<'a> {
    edit: Option<&'a MessageEnvelope>,
    deleted: bool,
    /// `(emoji, reactor)` -> `(seq, present)` of the reactor's latest.
    reactions: BTreeMap<(String, MemberKey), (u64, bool)>,
}

fn may_edit(target: &MessageEnvelope, actor: &MemberKey) -> bool {
    target.sender == *actor && matches!(target.body, EncryptedMessage::Content { .. })
}

fn may_delete(target: &MessageEnvelope, actor: &MemberKey, membership: &MembershipState) -> bool {
    target.sender == *actor
        || membership
            .get(actor)
            .is_some_and(|r| r.is_active() && r.role == Role::Admin)
}

fn is_visible(envelope: &MessageEnvelope, membership: &MembershipState) -> bool {
    membership.get(&envelope.sender).is_some_and(|r| {
        r.accepted && r.removed_at_ms.map_or(true, |t| envelope.timestamp_ms <= t)
    })
}

fn view_of(
    envelope: &MessageEnvelope,
    key: Option<&GroupKey>,
    notes: Option<&Annotations<'_>>,
) -> MessageView {
    let mut view = MessageView {
        id: envelope.id(),
        sender: envelope.sender,
        timestamp_ms: envelope.timestamp_ms,
        body: MessageBody::Deleted,
        edited: false,
        reactions: BTreeMap::new(),
    };
    if notes.is_some_and(|n| n.deleted) {
        return view;
    }
    let edit = notes.and_then(|n| n.edit);
    view.edited = edit.is_some();
    let sealed = edit.unwrap_or(envelope);
    view.body = match &envelope.body {
        EncryptedMessage::System(notice) => MessageBody::System(notice.clone()),
        _ => match key.map(|k| decrypt(k, sealed)) {
            Some(Ok(plain)) => MessageBody::Content(plain),
            _ => MessageBody::Unreadable,
        },
    };
    if let Some(notes) = notes {
        for ((emoji, reactor), (_, present)) in &notes.reactions {
            if *present {
                view.reactions.entry(emoji.clone()).or_default().push(*reactor);
            }
        }
    }
    view
}
