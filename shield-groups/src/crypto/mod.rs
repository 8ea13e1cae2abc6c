pub mod encryption;
pub mod key_exchange;
pub mod signing;

pub use encryption::{
    derive_key, derive_key_from_passphrase, generate_key, open, seal, EncryptionError, KdfParams,
    NONCE_SIZE,
};
pub use key_exchange::{
    derive_shared_secret, derive_shared_secret_ephemeral, generate_ephemeral_key,
    generate_static_keypair, KeyExchangeError,
};
pub use signing::{derive_public_key, generate_keypair, sign_data, verify_signature, SigningError};
