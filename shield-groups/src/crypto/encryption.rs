use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Encrypt with XChaCha20-Poly1305, binding `aad` into the tag.
///
/// The nonce is drawn from the OS RNG here and returned alongside the
/// ciphertext. Callers cannot supply their own.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| EncryptionError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate a ciphertext produced by [`seal`].
pub fn open(key: &[u8], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(EncryptionError::DecryptionFailed);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| EncryptionError::InvalidKeyLength)?;

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Generate a random 32-byte key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// HKDF-SHA256 expand of a 32-byte shared secret into a 32-byte key.
pub fn derive_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE]> {
    if shared_secret.len() != KEY_SIZE {
        return Err(EncryptionError::InvalidKeyLength);
    }
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut out)
        .map_err(|_| EncryptionError::KeyDerivationFailed)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Passphrase KDF
// ---------------------------------------------------------------------------

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            mem_cost_kib: 65536, // 64 MiB
            time_cost: 4,
            parallelism: 2,
        }
    }
}

/// Derive a 32-byte key from a passphrase using Argon2id.
pub fn derive_key_from_passphrase(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<[u8; KEY_SIZE]> {
    let params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|_| EncryptionError::KeyDerivationFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|_| EncryptionError::KeyDerivationFailed)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let (nonce, ct) = seal(&key, b"hello group", b"header").unwrap();
        assert_eq!(ct.len(), b"hello group".len() + TAG_SIZE);
        let pt = open(&key, &nonce, &ct, b"header").unwrap();
        assert_eq!(pt, b"hello group");
    }

    #[test]
    fn test_open_rejects_wrong_key_and_aad() {
        let key = generate_key();
        let (nonce, ct) = seal(&key, b"secret", b"aad").unwrap();
        assert!(matches!(
            open(&generate_key(), &nonce, &ct, b"aad"),
            Err(EncryptionError::DecryptionFailed)
        ));
        assert!(matches!(
            open(&key, &nonce, &ct, b"other"),
            Err(EncryptionError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = generate_key();
        let (n1, _) = seal(&key, b"a", b"").unwrap();
        let (n2, _) = seal(&key, b"a", b"").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn test_passphrase_kdf_deterministic() {
        let params = KdfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        };
        let a = derive_key_from_passphrase(b"pw", b"saltsaltsaltsalt", &params).unwrap();
        let b = derive_key_from_passphrase(b"pw", b"saltsaltsaltsalt", &params).unwrap();
        let c = derive_key_from_passphrase(b"pw2", b"saltsaltsaltsalt", &params).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
