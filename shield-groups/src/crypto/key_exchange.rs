use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum KeyExchangeError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Shared secret is all zeros")]
    NonContributory,
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

/// Generate a static X25519 keypair
///
/// # Returns
/// (public_key, secret_key) - Both as 32-byte arrays
pub fn generate_static_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public.to_bytes(), secret.to_bytes())
}

/// Generate an ephemeral X25519 keypair for a single wrap.
pub fn generate_ephemeral_key() -> ([u8; 32], EphemeralSecret) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (public.to_bytes(), secret)
}

/// X25519 with our static secret.
pub fn derive_shared_secret(our_private_key: &[u8], their_public_key: &[u8]) -> Result<[u8; 32]> {
    let secret_bytes: [u8; 32] = our_private_key
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidKeyLength)?;
    let public = parse_public(their_public_key)?;

    let shared = StaticSecret::from(secret_bytes).diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }
    Ok(shared.to_bytes())
}

/// X25519 with a one-shot ephemeral secret (consumed).
pub fn derive_shared_secret_ephemeral(
    ephemeral_secret: EphemeralSecret,
    their_public_key: &[u8],
) -> Result<[u8; 32]> {
    let public = parse_public(their_public_key)?;
    let shared = ephemeral_secret.diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(KeyExchangeError::NonContributory);
    }
    Ok(shared.to_bytes())
}

pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    let secret_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidKeyLength)?;
    Ok(PublicKey::from(&StaticSecret::from(secret_bytes)).to_bytes())
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey> {
    let public_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidKeyLength)?;
    Ok(PublicKey::from(public_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_static_agree() {
        let (bob_pub, bob_priv) = generate_static_keypair();
        let (eph_pub, eph_secret) = generate_ephemeral_key();

        let alice_side = derive_shared_secret_ephemeral(eph_secret, &bob_pub).unwrap();
        let bob_side = derive_shared_secret(&bob_priv, &eph_pub).unwrap();
        assert_eq!(alice_side, bob_side);
    }

    #[test]
    fn test_derive_public_key() {
        let (public, private) = generate_static_keypair();
        assert_eq!(derive_public_key(&private).unwrap(), public);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (_, private) = generate_static_keypair();
        assert!(matches!(
            derive_shared_secret(&private, &[0u8; 32]),
            Err(KeyExchangeError::NonContributory)
        ));
    }

    #[test]
    fn test_invalid_length() {
        assert!(derive_shared_secret(&[0u8; 31], &[0u8; 32]).is_err());
    }
}
