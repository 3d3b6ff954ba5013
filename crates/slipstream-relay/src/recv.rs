//! Per-worker receive loop.
//!
//! Each worker owns its own reuse-port socket and runs the same loop:
//! receive, dispatch through the packet state machine, and perform whatever
//! send the handler decided on. The periodic timeout keeps the loop
//! re-checking the shutdown flags even when the socket is quiet.

use std::sync::Arc;
use std::time::Duration;

use slipstream_proto::{PacketType, MAX_PACKET_BYTES, UDP_IPV4_HEADER_BYTES};
use tokio::net::UdpSocket;
use tracing::{debug, error};

use crate::handlers::{self, HandlerState};
use crate::shutdown::Shutdown;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub async fn recv_loop(socket: Arc<UdpSocket>, state: Arc<HandlerState>, shutdown: Arc<Shutdown>) {
    let mut buf = vec![0u8; MAX_PACKET_BYTES];

    while shutdown.receiving() {
        let (len, src) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(err) => {
                    debug!("failed to receive packet: {err}");
                    continue;
                }
            },
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => continue,
        };

        let draining = !shutdown.alive();
        let Some(out) = handlers::handle_packet(&state, &mut buf, len, src, draining) else {
            continue;
        };

        let class = PacketType::try_from(buf[out.start]).ok();
        match socket.send_to(&buf[out.start..out.start + out.len], out.dest).await {
            Ok(_) => state
                .recorder
                .tx
                .counter(class)
                .add(out.len + UDP_IPV4_HEADER_BYTES),
            Err(err) => error!("failed to forward packet to {}: {err}", out.dest),
        }
    }

    debug!("receive loop exiting");
}
