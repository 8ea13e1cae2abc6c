//! Group key lifecycle.
//!
//! One random 32-byte key per group, created with the group and never
//! rotated. It reaches members as an [`EncryptedKeyBlob`] (ephemeral X25519
//! to the member's published encryption key, HKDF-SHA256, XChaCha20-Poly1305)
//! and is kept at rest under a [`LocalVault`] derived from the database
//! passphrase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::RetryPolicy;
use crate::crdt::ids::{GroupId, MemberKey};
use crate::crypto::encryption::{self, EncryptionError, KdfParams, NONCE_SIZE};
use crate::crypto::key_exchange::{self, KeyExchangeError};

const WRAP_INFO: &[u8] = b"SG-KEYWRAP-v1";
const VAULT_INFO: &[u8] = b"SG-VAULT-v1";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key delivery failed: {0}")]
    KeyDeliveryFailure(String),
    #[error("Member has not published an encryption key")]
    NoEncryptionKey,
    #[error("Malformed key material")]
    Malformed,
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
}

// ---------------------------------------------------------------------------
// GroupKey
// ---------------------------------------------------------------------------

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey([u8; 32]);

impl GroupKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for GroupKey {}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

pub fn create_group_key() -> GroupKey {
    GroupKey(encryption::generate_key())
}

// ---------------------------------------------------------------------------
// Per-member wrapping
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyBlob {
    pub ephemeral_pubkey: [u8; 32],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

fn wrap_aad(group_id: &GroupId, recipient: &MemberKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    aad.extend_from_slice(group_id.as_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

fn wrap_key(
    shared: &[u8; 32],
    group_id: &GroupId,
    ephemeral_pubkey: &[u8; 32],
    recipient_enc_pubkey: &[u8; 32],
) -> Result<[u8; 32], EncryptionError> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 64);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral_pubkey);
    info.extend_from_slice(recipient_enc_pubkey);
    encryption::derive_key(shared, group_id.as_bytes(), &info)
}

/// Wrap `key` for one member's X25519 encryption key.
pub fn wrap_for_member(
    key: &GroupKey,
    group_id: &GroupId,
    recipient: &MemberKey,
    recipient_enc_pubkey: &[u8; 32],
) -> Result<EncryptedKeyBlob, KeyError> {
    let (ephemeral_pubkey, ephemeral_secret) = key_exchange::generate_ephemeral_key();
    let mut shared =
        key_exchange::derive_shared_secret_ephemeral(ephemeral_secret, recipient_enc_pubkey)?;
    let mut kek = wrap_key(&shared, group_id, &ephemeral_pubkey, recipient_enc_pubkey)?;
    shared.zeroize();

    let sealed = encryption::seal(&kek, key.as_bytes(), &wrap_aad(group_id, recipient));
    kek.zeroize();
    let (nonce, ciphertext) = sealed?;

    Ok(EncryptedKeyBlob {
        ephemeral_pubkey,
        nonce,
        ciphertext,
    })
}

/// Recover the group key from a blob addressed to `me`.
pub fn unwrap(
    blob: &EncryptedKeyBlob,
    group_id: &GroupId,
    me: &MemberKey,
    my_enc_secret: &[u8; 32],
) -> Result<GroupKey, KeyError> {
    let my_enc_pubkey = key_exchange::derive_public_key(my_enc_secret)?;
    let mut shared = key_exchange::derive_shared_secret(my_enc_secret, &blob.ephemeral_pubkey)?;
    let mut kek = wrap_key(&shared, group_id, &blob.ephemeral_pubkey, &my_enc_pubkey)?;
    shared.zeroize();

    let opened = encryption::open(&kek, &blob.nonce, &blob.ciphertext, &wrap_aad(group_id, me));
    kek.zeroize();
    let mut plain = opened.map_err(|_| KeyError::KeyDeliveryFailure("unwrap failed".into()))?;

    let bytes: Result<[u8; 32], _> = plain.as_slice().try_into();
    plain.zeroize();
    bytes.map(GroupKey).map_err(|_| KeyError::Malformed)
}

// ---------------------------------------------------------------------------
// At-rest copy
// ---------------------------------------------------------------------------

/// Key-encryption key for group keys at rest.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LocalVault {
    key: [u8; 32],
}

impl LocalVault {
    /// Argon2id over the database passphrase with the store's salt.
    pub fn derive(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<Self, KeyError> {
        let mut stretched = encryption::derive_key_from_passphrase(passphrase, salt, params)?;
        let key = encryption::derive_key(&stretched, salt, VAULT_INFO);
        stretched.zeroize();
        Ok(LocalVault { key: key? })
    }

    /// `nonce || ciphertext`, bound to the group id.
    pub fn encrypt_local_copy(&self, group_id: &GroupId, key: &GroupKey) -> Result<Vec<u8>, KeyError> {
        let (nonce, ciphertext) = encryption::seal(&self.key, key.as_bytes(), group_id.as_bytes())?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt_local_copy(&self, group_id: &GroupId, sealed: &[u8]) -> Result<GroupKey, KeyError> {
        if sealed.len() < NONCE_SIZE {
            return Err(KeyError::Malformed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| KeyError::Malformed)?;
        let mut plain = encryption::open(&self.key, &nonce, ciphertext, group_id.as_bytes())?;
        let bytes: Result<[u8; 32], _> = plain.as_slice().try_into();
        plain.zeroize();
        bytes.map(GroupKey).map_err(|_| KeyError::Malformed)
    }
}

// ---------------------------------------------------------------------------
// Delivery tracking
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Unconfirmed { attempts: u32, next_attempt_ms: u64 },
    Confirmed,
}

/// Per-member key delivery state for one group. Members with no entry
/// are due immediately.
#[derive(Clone, Debug)]
pub struct KeyDeliveryTracker {
    retry: RetryPolicy,
    statuses: BTreeMap<MemberKey, KeyStatus>,
}

impl KeyDeliveryTracker {
    pub fn new(retry: RetryPolicy) -> Self {
        KeyDeliveryTracker {
            retry,
            statuses: BTreeMap::new(),
        }
    }

    pub fn status(&self, member: &MemberKey) -> Option<KeyStatus> {
        self.statuses.get(member).copied()
    }

    pub fn is_confirmed(&self, member: &MemberKey) -> bool {
        matches!(self.statuses.get(member), Some(KeyStatus::Confirmed))
    }

    /// Of `candidates`, the unconfirmed ones whose retry time has come.
    pub fn due<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a MemberKey>,
        now_ms: u64,
    ) -> Vec<MemberKey> {
        candidates
            .into_iter()
            .filter(|m| match self.statuses.get(*m) {
                None => true,
                Some(KeyStatus::Confirmed) => false,
                Some(KeyStatus::Unconfirmed {
                    next_attempt_ms, ..
                }) => *next_attempt_ms <= now_ms,
            })
            .copied()
            .collect()
    }

    pub fn record_attempt(&mut self, member: MemberKey, now_ms: u64) {
        let attempts = match self.statuses.get(&member) {
            Some(KeyStatus::Confirmed) => return,
            Some(KeyStatus::Unconfirmed { attempts, .. }) => attempts.saturating_add(1),
            None => 0,
        };
        self.statuses.insert(
            member,
            KeyStatus::Unconfirmed {
                attempts,
                next_attempt_ms: now_ms.saturating_add(self.retry.delay_ms(attempts)),
            },
        );
    }

    pub fn confirm(&mut self, member: MemberKey) {
        self.statuses.insert(member, KeyStatus::Confirmed);
    }

    pub fn forget(&mut self, member: &MemberKey) {
        self.statuses.remove(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid() -> GroupId {
        GroupId([4u8; 32])
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let key = create_group_key();
        let bob = MemberKey([2u8; 32]);
        let (enc_pub, enc_priv) = key_exchange::generate_static_keypair();

        let blob = wrap_for_member(&key, &gid(), &bob, &enc_pub).unwrap();
        let recovered = unwrap(&blob, &gid(), &bob, &enc_priv).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn test_unwrap_with_wrong_secret_fails() {
        let key = create_group_key();
        let bob = MemberKey([2u8; 32]);
        let (enc_pub, _) = key_exchange::generate_static_keypair();
        let (_, other_priv) = key_exchange::generate_static_keypair();

        let blob = wrap_for_member(&key, &gid(), &bob, &enc_pub).unwrap();
        assert!(matches!(
            unwrap(&blob, &gid(), &bob, &other_priv),
            Err(KeyError::KeyDeliveryFailure(_))
        ));
    }

    #[test]
    fn test_blob_bound_to_recipient_and_group() {
        let key = create_group_key();
        let bob = MemberKey([2u8; 32]);
        let (enc_pub, enc_priv) = key_exchange::generate_static_keypair();
        let blob = wrap_for_member(&key, &gid(), &bob, &enc_pub).unwrap();

        assert!(unwrap(&blob, &GroupId([5u8; 32]), &bob, &enc_priv).is_err());
        assert!(unwrap(&blob, &gid(), &MemberKey([3u8; 32]), &enc_priv).is_err());
    }

    fn light_kdf() -> KdfParams {
        KdfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_local_copy_roundtrip() {
        let vault = LocalVault::derive(b"db pass", &[1u8; 16], &light_kdf()).unwrap();
        let key = create_group_key();
        let sealed = vault.encrypt_local_copy(&gid(), &key).unwrap();
        assert_eq!(vault.decrypt_local_copy(&gid(), &sealed).unwrap(), key);

        let other = LocalVault::derive(b"wrong", &[1u8; 16], &light_kdf()).unwrap();
        assert!(other.decrypt_local_copy(&gid(), &sealed).is_err());
        assert!(vault.decrypt_local_copy(&GroupId([6u8; 32]), &sealed).is_err());
    }

    #[test]
    fn test_tracker_backoff_and_confirm() {
        let mut tracker = KeyDeliveryTracker::new(RetryPolicy {
            base_ms: 100,
            cap_ms: 1_000,
        });
        let m = MemberKey([8u8; 32]);
        assert_eq!(tracker.due([&m], 0), vec![m]);

        tracker.record_attempt(m, 0);
        assert!(tracker.due([&m], 50).is_empty());
        assert_eq!(tracker.due([&m], 100), vec![m]);

        tracker.record_attempt(m, 100);
        assert_eq!(
            tracker.status(&m),
            Some(KeyStatus::Unconfirmed {
                attempts: 1,
                next_attempt_ms: 300
            })
        );

        tracker.confirm(m);
        assert!(tracker.due([&m], 10_000).is_empty());
        tracker.record_attempt(m, 10_000);
        assert!(tracker.is_confirmed(&m));
    }
}
