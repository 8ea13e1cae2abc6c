use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key().to_bytes(), signing_key.to_bytes())
}

/// Sign data with an Ed25519 private key, returning the 64-byte signature.
pub fn sign_data(data: &[u8], private_key: &[u8]) -> Result<[u8; 64]> {
    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| SigningError::InvalidKeyLength)?;
    let signing_key = SigningKey::from_bytes(&key_bytes);
    Ok(signing_key.sign(data).to_bytes())
}

/// Verify an Ed25519 signature.
///
/// `Ok(false)` means the signature is well-formed but does not match;
/// `Err` means the key or signature bytes could not be parsed.
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
    let pub_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| SigningError::InvalidKeyLength)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SigningError::InvalidSignature)?;

    let verifying_key =
        VerifyingKey::from_bytes(&pub_bytes).map_err(|_| SigningError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &sig).is_ok())
}

/// Derive the Ed25519 public key for a private key.
pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| SigningError::InvalidKeyLength)?;
    Ok(SigningKey::from_bytes(&key_bytes).verifying_key().to_bytes())
}
