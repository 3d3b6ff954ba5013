//! Periodic relay-ping emitter.
//!
//! Wakes every 10 ms and asks the relay manager which peers are due; the
//! manager spreads per-peer ping times across the ping period, so each wake
//! usually emits only a few packets.

use std::sync::Arc;
use std::time::Duration;

use slipstream_proto::{PacketType, RELAY_PING_PACKET_BYTES, UDP_IPV4_HEADER_BYTES};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::handlers::HandlerState;
use crate::shutdown::Shutdown;

pub async fn ping_loop(socket: Arc<UdpSocket>, state: Arc<HandlerState>, shutdown: Arc<Shutdown>) {
    let mut interval = tokio::time::interval(Duration::from_millis(10));

    while shutdown.alive() {
        interval.tick().await;

        for target in state.relay_manager.ping_targets() {
            if !shutdown.alive() {
                break;
            }

            let mut packet = [0u8; RELAY_PING_PACKET_BYTES];
            packet[0] = PacketType::RelayPing as u8;
            packet[1..].copy_from_slice(&target.sequence.to_le_bytes());

            match socket.send_to(&packet, target.addr).await {
                Ok(_) => state
                    .recorder
                    .tx
                    .counter(Some(PacketType::RelayPing))
                    .add(RELAY_PING_PACKET_BYTES + UDP_IPV4_HEADER_BYTES),
                Err(err) => debug!("failed to send relay ping to {}: {err}", target.addr),
            }
        }
    }

    debug!("ping loop exiting");
}
