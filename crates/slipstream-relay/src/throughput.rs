//! Per-class traffic counters.
//!
//! Every receive loop and sender bumps these with relaxed atomics; the
//! backend loop swaps them to zero once per update so each report covers
//! exactly the interval since the previous one.

use std::sync::atomic::{AtomicU64, Ordering};

use slipstream_proto::PacketType;

#[derive(Debug, Default)]
pub struct Counter {
    bytes: AtomicU64,
    packets: AtomicU64,
}

impl Counter {
    pub fn add(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    fn take_bytes(&self) -> u64 {
        self.packets.swap(0, Ordering::Relaxed);
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// One counter per packet class, plus a bucket for unknown types.
#[derive(Debug, Default)]
pub struct ClassCounters {
    pub route_request: Counter,
    pub route_response: Counter,
    pub client_to_server: Counter,
    pub server_to_client: Counter,
    pub session_ping: Counter,
    pub session_pong: Counter,
    pub continue_request: Counter,
    pub continue_response: Counter,
    pub relay_ping: Counter,
    pub relay_pong: Counter,
    pub near_ping: Counter,
    pub near_pong: Counter,
    pub unknown: Counter,
}

impl ClassCounters {
    pub fn counter(&self, packet_type: Option<PacketType>) -> &Counter {
        match packet_type {
            Some(PacketType::RouteRequest) => &self.route_request,
            Some(PacketType::RouteResponse) => &self.route_response,
            Some(PacketType::ClientToServer) => &self.client_to_server,
            Some(PacketType::ServerToClient) => &self.server_to_client,
            Some(PacketType::SessionPing) => &self.session_ping,
            Some(PacketType::SessionPong) => &self.session_pong,
            Some(PacketType::ContinueRequest) => &self.continue_request,
            Some(PacketType::ContinueResponse) => &self.continue_response,
            Some(PacketType::RelayPing) => &self.relay_ping,
            Some(PacketType::RelayPong) => &self.relay_pong,
            Some(PacketType::NearPing) => &self.near_ping,
            Some(PacketType::NearPong) => &self.near_pong,
            None => &self.unknown,
        }
    }

    fn all(&self) -> [&Counter; 13] {
        [
            &self.route_request,
            &self.route_response,
            &self.client_to_server,
            &self.server_to_client,
            &self.session_ping,
            &self.session_pong,
            &self.continue_request,
            &self.continue_response,
            &self.relay_ping,
            &self.relay_pong,
            &self.near_ping,
            &self.near_pong,
            &self.unknown,
        ]
    }

    fn take_bytes(&self) -> u64 {
        self.all().iter().map(|counter| counter.take_bytes()).sum()
    }
}

#[derive(Debug, Default)]
pub struct ThroughputRecorder {
    pub rx: ClassCounters,
    pub tx: ClassCounters,
}

impl ThroughputRecorder {
    /// Total (sent, received) bytes since the last call, zeroing everything.
    pub fn take_totals(&self) -> (u64, u64) {
        (self.tx.take_bytes(), self.rx.take_bytes())
    }
}
