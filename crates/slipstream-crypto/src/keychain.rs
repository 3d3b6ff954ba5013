//! Key material supplied at startup.
//!
//! All keys are 32-byte X25519 keys, configured as base64. Keys are never
//! generated here; provisioning is the backend's job.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crypto_box::{PublicKey, SecretKey};
use thiserror::Error;

/// Every key on the wire is 32 bytes.
pub const KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("{label} is not valid base64")]
    InvalidBase64 { label: &'static str },

    #[error("{label} must decode to {KEY_BYTES} bytes, got {got}")]
    InvalidLength { label: &'static str, got: usize },
}

/// The relay's own keypair plus the backend's public key.
#[derive(Debug)]
pub struct Keychain {
    pub relay_public_key: PublicKey,
    pub relay_secret_key: SecretKey,
    pub backend_public_key: PublicKey,
}

impl Keychain {
    pub fn from_base64(
        relay_public_key: &str,
        relay_secret_key: &str,
        backend_public_key: &str,
    ) -> Result<Self, KeychainError> {
        let relay_public = decode_key("relay public key", relay_public_key)?;
        let relay_secret = decode_key("relay private key", relay_secret_key)?;
        let backend_public = decode_key("backend public key", backend_public_key)?;

        Ok(Self {
            relay_public_key: PublicKey::from(relay_public),
            relay_secret_key: SecretKey::from(relay_secret),
            backend_public_key: PublicKey::from(backend_public),
        })
    }
}

fn decode_key(label: &'static str, encoded: &str) -> Result<[u8; KEY_BYTES], KeychainError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| KeychainError::InvalidBase64 { label })?;

    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeychainError::InvalidLength { label, got })
}
