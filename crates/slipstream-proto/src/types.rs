//! Packet type registry.
//!
//! The first byte of every UDP payload is the packet type. Dispatch is
//! exhaustive; an unknown byte is counted and dropped, never a panic.

use thiserror::Error;

/// Slipstream packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Install a session from a backend-issued route token and forward the
    /// remaining token list to the next hop.
    RouteRequest = 1,
    /// Acknowledgement flowing back towards the client.
    RouteResponse = 2,
    /// Data packet travelling client -> server.
    ClientToServer = 3,
    /// Data packet travelling server -> client.
    ServerToClient = 4,
    /// In-session keepalive towards the server.
    SessionPing = 5,
    /// In-session keepalive towards the client.
    SessionPong = 6,
    /// Refresh a session's expiry from a continue token.
    ContinueRequest = 7,
    /// Acknowledgement for a continue request.
    ContinueResponse = 8,
    /// Relay-to-relay RTT probe.
    RelayPing = 11,
    /// Reply to a relay ping.
    RelayPong = 12,
    /// Client-facing latency probe.
    NearPing = 73,
    /// Reply to a near ping.
    NearPong = 74,
}

#[derive(Debug, Error)]
#[error("unknown packet type: {0}")]
pub struct UnknownPacketType(pub u8);

impl TryFrom<u8> for PacketType {
    type Error = UnknownPacketType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RouteRequest),
            2 => Ok(Self::RouteResponse),
            3 => Ok(Self::ClientToServer),
            4 => Ok(Self::ServerToClient),
            5 => Ok(Self::SessionPing),
            6 => Ok(Self::SessionPong),
            7 => Ok(Self::ContinueRequest),
            8 => Ok(Self::ContinueResponse),
            11 => Ok(Self::RelayPing),
            12 => Ok(Self::RelayPong),
            73 => Ok(Self::NearPing),
            74 => Ok(Self::NearPong),
            other => Err(UnknownPacketType(other)),
        }
    }
}

impl PacketType {
    /// Types whose header sequence must carry the response/ping-family bit.
    pub fn is_response_family(self) -> bool {
        matches!(
            self,
            Self::SessionPing | Self::SessionPong | Self::RouteResponse | Self::ContinueResponse
        )
    }
}
