//! Local identity provider.
//!
//! The core never stores key material itself; it asks an
//! [`IdentityProvider`] for it when needed.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crdt::ids::MemberKey;
use crate::crypto::{key_exchange, signing, KeyExchangeError, SigningError};

pub trait IdentityProvider: Send + Sync {
    /// `(public, private)` Ed25519 keypair.
    fn signing_keypair(&self) -> ([u8; 32], Zeroizing<[u8; 32]>);

    /// `(public, private)` X25519 keypair published in `Accept` ops.
    fn encryption_keypair(&self) -> ([u8; 32], Zeroizing<[u8; 32]>);

    /// Secret the at-rest vault key is stretched from.
    fn database_passphrase(&self) -> Zeroizing<Vec<u8>>;

    fn member_key(&self) -> MemberKey {
        MemberKey(self.signing_keypair().0)
    }
}

/// Keys held in memory. Used by tests and by embedders whose key store
/// lives elsewhere.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticIdentity {
    signing_public: [u8; 32],
    signing_private: [u8; 32],
    encryption_public: [u8; 32],
    encryption_private: [u8; 32],
    passphrase: Vec<u8>,
}

impl StaticIdentity {
    /// Fresh random keys.
    pub fn generate(passphrase: &[u8]) -> Self {
        let (signing_public, signing_private) = signing::generate_keypair();
        let (encryption_public, encryption_private) = key_exchange::generate_static_keypair();
        StaticIdentity {
            signing_public,
            signing_private,
            encryption_public,
            encryption_private,
            passphrase: passphrase.to_vec(),
        }
    }

    /// Rebuild from stored private keys; public halves are derived.
    pub fn from_private_keys(
        signing_private: [u8; 32],
        encryption_private: [u8; 32],
        passphrase: &[u8],
    ) -> Result<Self, IdentityError> {
        Ok(StaticIdentity {
            signing_public: signing::derive_public_key(&signing_private)?,
            signing_private,
            encryption_public: key_exchange::derive_public_key(&encryption_private)?,
            encryption_private,
            passphrase: passphrase.to_vec(),
        })
    }
}

impl std::fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticIdentity")
            .field("member", &MemberKey(self.signing_public))
            .finish_non_exhaustive()
    }
}

impl IdentityProvider for StaticIdentity {
    fn signing_keypair(&self) -> ([u8; 32], Zeroizing<[u8; 32]>) {
        (self.signing_public, Zeroizing::new(self.signing_private))
    }

    fn encryption_keypair(&self) -> ([u8; 32], Zeroizing<[u8; 32]>) {
        (self.encryption_public, Zeroizing::new(self.encryption_private))
    }

    fn database_passphrase(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.passphrase.clone())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_private_keys_matches_generated() {
        let id = StaticIdentity::generate(b"pw");
        let (sig_pub, sig_priv) = id.signing_keypair();
        let (enc_pub, enc_priv) = id.encryption_keypair();
        let rebuilt = StaticIdentity::from_private_keys(*sig_priv, *enc_priv, b"pw").unwrap();
        assert_eq!(rebuilt.signing_keypair().0, sig_pub);
        assert_eq!(rebuilt.encryption_keypair().0, enc_pub);
        assert_eq!(rebuilt.member_key(), MemberKey(sig_pub));
        assert_eq!(rebuilt.database_passphrase().as_slice(), b"pw");
    }
}
