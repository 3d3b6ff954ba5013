//! Backend-issued session tokens.
//!
//! Route tokens install a session; continue tokens refresh one. Both travel
//! in a libsodium `crypto_box` envelope: a random 24-byte nonce followed by
//! the XSalsa20-Poly1305 ciphertext (plaintext + 16-byte MAC). The sender is
//! the backend and the receiver is this relay; `write_encrypted` exists so
//! the decode paths can be exercised end to end in tests.

use std::net::SocketAddr;

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use slipstream_proto::wire::{self, WireError};
use thiserror::Error;

use crate::keychain::KEY_BYTES;

pub const TOKEN_NONCE_BYTES: usize = 24;
pub const TOKEN_MAC_BYTES: usize = 16;

/// Shared prefix: expire timestamp (8), session id (8), session version (1).
const TOKEN_BODY_BYTES: usize = 17;

pub const ROUTE_TOKEN_PLAINTEXT_BYTES: usize =
    TOKEN_BODY_BYTES + 4 + 4 + wire::ADDRESS_BYTES + KEY_BYTES;
pub const CONTINUE_TOKEN_PLAINTEXT_BYTES: usize = TOKEN_BODY_BYTES;

/// On-the-wire sizes: nonce + ciphertext + MAC.
pub const ROUTE_TOKEN_BYTES: usize =
    TOKEN_NONCE_BYTES + ROUTE_TOKEN_PLAINTEXT_BYTES + TOKEN_MAC_BYTES;
pub const CONTINUE_TOKEN_BYTES: usize =
    TOKEN_NONCE_BYTES + CONTINUE_TOKEN_PLAINTEXT_BYTES + TOKEN_MAC_BYTES;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token truncated: {0} bytes")]
    TooShort(usize),

    #[error("token decryption failed")]
    Decrypt,

    #[error("token encryption failed")]
    Encrypt,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Installs a session: identity, expiry, envelope budgets, the next hop,
/// and the session's header key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteToken {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_addr: Option<SocketAddr>,
    pub private_key: [u8; KEY_BYTES],
}

/// Refreshes an installed session's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueToken {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
}

impl RouteToken {
    /// Session table key.
    pub fn hash(&self) -> u64 {
        self.session_id ^ u64::from(self.session_version)
    }

    pub fn expired(&self, current_time: u64) -> bool {
        self.expire_timestamp <= current_time
    }

    /// Consume the nonce at `index`, open the box, and parse the plaintext.
    pub fn read_encrypted(
        buf: &[u8],
        index: &mut usize,
        sender_public_key: &PublicKey,
        receiver_secret_key: &SecretKey,
    ) -> Result<Self, TokenError> {
        let plaintext = open_envelope(
            buf,
            index,
            ROUTE_TOKEN_BYTES,
            sender_public_key,
            receiver_secret_key,
        )?;

        let mut i = 0;
        let (expire_timestamp, session_id, session_version) = read_body(&plaintext, &mut i)?;
        let kbps_up = wire::read_u32(&plaintext, &mut i)?;
        let kbps_down = wire::read_u32(&plaintext, &mut i)?;
        let next_addr = wire::read_address(&plaintext, &mut i)?;
        let mut private_key = [0u8; KEY_BYTES];
        wire::read_bytes(&plaintext, &mut i, &mut private_key)?;

        Ok(Self {
            expire_timestamp,
            session_id,
            session_version,
            kbps_up,
            kbps_down,
            next_addr,
            private_key,
        })
    }

    /// Serialize, seal, and write nonce + ciphertext at `index`.
    pub fn write_encrypted(
        &self,
        buf: &mut [u8],
        index: &mut usize,
        sender_secret_key: &SecretKey,
        receiver_public_key: &PublicKey,
    ) -> Result<(), TokenError> {
        let mut plaintext = [0u8; ROUTE_TOKEN_PLAINTEXT_BYTES];
        let mut i = 0;
        write_body(
            &mut plaintext,
            &mut i,
            self.expire_timestamp,
            self.session_id,
            self.session_version,
        )?;
        wire::write_u32(&mut plaintext, &mut i, self.kbps_up)?;
        wire::write_u32(&mut plaintext, &mut i, self.kbps_down)?;
        wire::write_address(&mut plaintext, &mut i, self.next_addr)?;
        wire::write_bytes(&mut plaintext, &mut i, &self.private_key)?;

        seal_envelope(
            buf,
            index,
            &plaintext,
            sender_secret_key,
            receiver_public_key,
        )
    }
}

impl ContinueToken {
    pub fn hash(&self) -> u64 {
        self.session_id ^ u64::from(self.session_version)
    }

    pub fn expired(&self, current_time: u64) -> bool {
        self.expire_timestamp <= current_time
    }

    pub fn read_encrypted(
        buf: &[u8],
        index: &mut usize,
        sender_public_key: &PublicKey,
        receiver_secret_key: &SecretKey,
    ) -> Result<Self, TokenError> {
        let plaintext = open_envelope(
            buf,
            index,
            CONTINUE_TOKEN_BYTES,
            sender_public_key,
            receiver_secret_key,
        )?;

        let mut i = 0;
        let (expire_timestamp, session_id, session_version) = read_body(&plaintext, &mut i)?;

        Ok(Self {
            expire_timestamp,
            session_id,
            session_version,
        })
    }

    pub fn write_encrypted(
        &self,
        buf: &mut [u8],
        index: &mut usize,
        sender_secret_key: &SecretKey,
        receiver_public_key: &PublicKey,
    ) -> Result<(), TokenError> {
        let mut plaintext = [0u8; CONTINUE_TOKEN_PLAINTEXT_BYTES];
        let mut i = 0;
        write_body(
            &mut plaintext,
            &mut i,
            self.expire_timestamp,
            self.session_id,
            self.session_version,
        )?;

        seal_envelope(
            buf,
            index,
            &plaintext,
            sender_secret_key,
            receiver_public_key,
        )
    }
}

fn read_body(buf: &[u8], index: &mut usize) -> Result<(u64, u64, u8), TokenError> {
    let expire_timestamp = wire::read_u64(buf, index)?;
    let session_id = wire::read_u64(buf, index)?;
    let session_version = wire::read_u8(buf, index)?;
    Ok((expire_timestamp, session_id, session_version))
}

fn write_body(
    buf: &mut [u8],
    index: &mut usize,
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
) -> Result<(), TokenError> {
    wire::write_u64(buf, index, expire_timestamp)?;
    wire::write_u64(buf, index, session_id)?;
    wire::write_u8(buf, index, session_version)?;
    Ok(())
}

fn open_envelope(
    buf: &[u8],
    index: &mut usize,
    signed_len: usize,
    sender_public_key: &PublicKey,
    receiver_secret_key: &SecretKey,
) -> Result<Vec<u8>, TokenError> {
    if *index + signed_len > buf.len() {
        return Err(TokenError::TooShort(buf.len()));
    }

    let nonce = Nonce::clone_from_slice(&buf[*index..*index + TOKEN_NONCE_BYTES]);
    let ciphertext = &buf[*index + TOKEN_NONCE_BYTES..*index + signed_len];

    let envelope = SalsaBox::new(sender_public_key, receiver_secret_key);
    let plaintext = envelope
        .decrypt(&nonce, ciphertext)
        .map_err(|_| TokenError::Decrypt)?;

    *index += signed_len;
    Ok(plaintext)
}

fn seal_envelope(
    buf: &mut [u8],
    index: &mut usize,
    plaintext: &[u8],
    sender_secret_key: &SecretKey,
    receiver_public_key: &PublicKey,
) -> Result<(), TokenError> {
    let signed_len = TOKEN_NONCE_BYTES + plaintext.len() + TOKEN_MAC_BYTES;
    if *index + signed_len > buf.len() {
        return Err(TokenError::TooShort(buf.len()));
    }

    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let envelope = SalsaBox::new(receiver_public_key, sender_secret_key);
    let ciphertext = envelope
        .encrypt(&nonce, plaintext)
        .map_err(|_| TokenError::Encrypt)?;

    wire::write_bytes(buf, index, &nonce)?;
    wire::write_bytes(buf, index, &ciphertext)?;
    Ok(())
}
