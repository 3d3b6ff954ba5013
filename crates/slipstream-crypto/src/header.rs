//! Authenticated packet header.
//!
//! Wire form is 18 plaintext bytes — type (1), sequence (8), session id (8),
//! session version (1) — followed by a 16-byte ChaCha20-Poly1305 IETF tag.
//! The tag is produced by encrypting a zero-length message with the session
//! id and version as associated data and a nonce of `u32(0) || sequence`;
//! the header's semantic payload is protected purely by the tag.
//!
//! The top sequence bit encodes direction (set = server to client), the
//! second bit marks the response/ping packet family. Both must agree with
//! the packet type or the header is rejected before any crypto runs.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use slipstream_proto::{wire, PacketType, UnknownPacketType};
use thiserror::Error;

use crate::keychain::KEY_BYTES;

pub const HEADER_PLAINTEXT_BYTES: usize = 18;
pub const HEADER_TAG_BYTES: usize = 16;
pub const HEADER_BYTES: usize = HEADER_PLAINTEXT_BYTES + HEADER_TAG_BYTES;

/// Session id (8) + session version (1), authenticated as associated data.
const AAD_BYTES: usize = 9;

const DIRECTION_BIT: u64 = 1 << 63;
const RESPONSE_BIT: u64 = 1 << 62;
const SEQUENCE_MASK: u64 = !(DIRECTION_BIT | RESPONSE_BIT);

/// Which way a packet travels along the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header truncated: {0} bytes")]
    TooShort(usize),

    #[error(transparent)]
    UnknownType(#[from] UnknownPacketType),

    #[error("sequence direction bit does not match packet direction")]
    DirectionBit,

    #[error("sequence response bit does not match packet type")]
    ResponseBit,

    #[error("header authentication failed")]
    BadTag,
}

/// The authenticated header carried by every in-session packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub sequence: u64,
    pub session_id: u64,
    pub session_version: u8,
}

impl Header {
    /// Session table key.
    pub fn hash(&self) -> u64 {
        self.session_id ^ u64::from(self.session_version)
    }

    /// Sequence with the direction and response bits masked off; this is the
    /// value replay protection operates on.
    pub fn clean_sequence(&self) -> u64 {
        self.sequence & SEQUENCE_MASK
    }

    /// Parse the plaintext prefix and enforce the sequence bit invariants.
    /// Does not authenticate; call [`Header::verify`] before trusting it.
    pub fn read(buf: &[u8], index: &mut usize, direction: Direction) -> Result<Self, HeaderError> {
        if *index + HEADER_BYTES > buf.len() {
            return Err(HeaderError::TooShort(buf.len()));
        }

        let mut i = *index;
        let packet_type = PacketType::try_from(read_u8(buf, &mut i)?)?;
        let sequence = read_u64(buf, &mut i)?;

        check_sequence_bits(packet_type, sequence, direction)?;

        let session_id = read_u64(buf, &mut i)?;
        let session_version = read_u8(buf, &mut i)?;

        *index += HEADER_PLAINTEXT_BYTES;

        Ok(Self {
            packet_type,
            sequence,
            session_id,
            session_version,
        })
    }

    /// Emit the 18 plaintext bytes followed by the authentication tag.
    ///
    /// The caller must have set the direction and response bits on
    /// `sequence` to match the type; a mismatch is refused.
    pub fn write(
        &self,
        buf: &mut [u8],
        index: &mut usize,
        direction: Direction,
        private_key: &[u8; KEY_BYTES],
    ) -> Result<(), HeaderError> {
        if *index + HEADER_BYTES > buf.len() {
            return Err(HeaderError::TooShort(buf.len()));
        }

        check_sequence_bits(self.packet_type, self.sequence, direction)?;

        let mut i = *index;
        wire::write_u8(buf, &mut i, self.packet_type as u8).map_err(too_short)?;
        wire::write_u64(buf, &mut i, self.sequence).map_err(too_short)?;

        let aad_start = i;
        wire::write_u64(buf, &mut i, self.session_id).map_err(too_short)?;
        wire::write_u8(buf, &mut i, self.session_version).map_err(too_short)?;

        let tag = compute_tag(
            self.sequence,
            &buf[aad_start..aad_start + AAD_BYTES],
            private_key,
        )?;
        wire::write_bytes(buf, &mut i, &tag).map_err(too_short)?;

        *index = i;
        Ok(())
    }

    /// Recompute the tag over the header at `index` and reject on mismatch.
    /// The sequence bit invariants are re-checked so this is safe to call on
    /// a buffer that has not been through [`Header::read`].
    pub fn verify(
        buf: &[u8],
        index: usize,
        direction: Direction,
        private_key: &[u8; KEY_BYTES],
    ) -> Result<(), HeaderError> {
        if index + HEADER_BYTES > buf.len() {
            return Err(HeaderError::TooShort(buf.len()));
        }

        let mut i = index;
        let packet_type = PacketType::try_from(read_u8(buf, &mut i)?)?;
        let sequence = read_u64(buf, &mut i)?;

        check_sequence_bits(packet_type, sequence, direction)?;

        let aad = &buf[i..i + AAD_BYTES];
        let tag = &buf[index + HEADER_PLAINTEXT_BYTES..index + HEADER_BYTES];

        let cipher = ChaCha20Poly1305::new(Key::from_slice(private_key));
        cipher
            .decrypt(&header_nonce(sequence), Payload { msg: tag, aad })
            .map(|_| ())
            .map_err(|_| HeaderError::BadTag)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{}", self.session_id, self.session_version)
    }
}

fn check_sequence_bits(
    packet_type: PacketType,
    sequence: u64,
    direction: Direction,
) -> Result<(), HeaderError> {
    let direction_bit = sequence & DIRECTION_BIT != 0;
    match direction {
        Direction::ServerToClient if !direction_bit => return Err(HeaderError::DirectionBit),
        Direction::ClientToServer if direction_bit => return Err(HeaderError::DirectionBit),
        _ => {}
    }

    if packet_type.is_response_family() != (sequence & RESPONSE_BIT != 0) {
        return Err(HeaderError::ResponseBit);
    }

    Ok(())
}

/// 12-byte nonce: four zero bytes then the full sequence, little-endian.
fn header_nonce(sequence: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    Nonce::from(nonce)
}

fn compute_tag(
    sequence: u64,
    aad: &[u8],
    private_key: &[u8; KEY_BYTES],
) -> Result<[u8; HEADER_TAG_BYTES], HeaderError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(private_key));
    let tag = cipher
        .encrypt(&header_nonce(sequence), Payload { msg: &[], aad })
        .map_err(|_| HeaderError::BadTag)?;

    tag.try_into().map_err(|_| HeaderError::BadTag)
}

fn read_u8(buf: &[u8], index: &mut usize) -> Result<u8, HeaderError> {
    wire::read_u8(buf, index).map_err(too_short)
}

fn read_u64(buf: &[u8], index: &mut usize) -> Result<u64, HeaderError> {
    wire::read_u64(buf, index).map_err(too_short)
}

fn too_short(_: wire::WireError) -> HeaderError {
    HeaderError::TooShort(0)
}

/// Set the direction and response bits a sequence must carry for the given
/// packet type and direction.
pub fn sequence_bits(packet_type: PacketType, direction: Direction, sequence: u64) -> u64 {
    let mut out = sequence & SEQUENCE_MASK;
    if direction == Direction::ServerToClient {
        out |= DIRECTION_BIT;
    }
    if packet_type.is_response_family() {
        out |= RESPONSE_BIT;
    }
    out
}
