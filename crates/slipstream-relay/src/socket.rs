//! UDP socket construction.
//!
//! Every receive worker binds the same address with `SO_REUSEPORT` so the
//! kernel spreads flows across them; buffer sizes come from configuration.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

pub fn bind_udp(
    addr: SocketAddr,
    send_buffer_size: usize,
    recv_buffer_size: usize,
) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_send_buffer_size(send_buffer_size)?;
    socket.set_recv_buffer_size(recv_buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}
