//! Core Slipstream protocol types, wire codec, and constants.
//!
//! Everything on the wire is little-endian. This crate is deliberately free
//! of crypto and I/O so the codec can be exercised byte-for-byte in tests.

#![forbid(unsafe_code)]

pub mod types;
pub mod wire;

pub use types::{PacketType, UnknownPacketType};
pub use wire::{read_address, write_address, WireError, ADDRESS_BYTES};

/// Maximum payload the relay will carry for a data packet.
pub const MTU: usize = 1200;

/// Largest UDP datagram the relay will receive.
pub const MAX_PACKET_BYTES: usize = 1500;

/// Relay ping/pong packets are a type byte plus a u64 sequence.
pub const RELAY_PING_PACKET_BYTES: usize = 1 + 8;

/// Near ping carries 16 trailing bytes of anti-spoofing material that are
/// stripped before the pong is echoed.
pub const NEAR_PING_PACKET_BYTES: usize = 33;
pub const NEAR_PONG_PACKET_BYTES: usize = NEAR_PING_PACKET_BYTES - 16;

/// Upper bound on the peer relay set.
pub const MAX_RELAYS: usize = 1024;

/// Seconds between pings to a single peer relay.
pub const PING_PERIOD: f64 = 1.0;

/// Trailing window over which per-peer route stats are derived.
pub const STATS_WINDOW: f64 = 10.0;

/// Tail of the stats window excluded so in-flight pongs can still land.
pub const PING_SAFETY: f64 = 1.0;

/// Fixed per-datagram overhead estimate (IPv4 + UDP headers) used by the
/// throughput counters.
pub const UDP_IPV4_HEADER_BYTES: usize = 28;
