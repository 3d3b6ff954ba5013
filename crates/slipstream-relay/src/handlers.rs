//! The per-packet state machine.
//!
//! Handlers are pure functions over the packet buffer and the shared relay
//! state: they classify, authenticate, and mutate session state, then
//! return at most one outbound send (a destination plus a byte range of the
//! same buffer). The receive loop owns the socket and performs the send, so
//! every handler is unit-testable without one.
//!
//! No error crosses a datagram boundary; every failure is a drop.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use slipstream_crypto::header::{Direction, Header, HEADER_BYTES};
use slipstream_crypto::token::{ContinueToken, RouteToken, CONTINUE_TOKEN_BYTES, ROUTE_TOKEN_BYTES};
use slipstream_crypto::Keychain;
use slipstream_proto::{
    wire, PacketType, MTU, NEAR_PING_PACKET_BYTES, RELAY_PING_PACKET_BYTES, UDP_IPV4_HEADER_BYTES,
};
use tracing::{debug, error, info};

use crate::relay_manager::RelayManager;
use crate::router_info::RouterInfo;
use crate::session::{Session, SessionHandle, SessionMap};
use crate::throughput::ThroughputRecorder;

/// Shared state every receive worker dispatches against.
pub struct HandlerState {
    pub keychain: Keychain,
    pub sessions: SessionMap,
    pub relay_manager: RelayManager,
    pub recorder: ThroughputRecorder,
    pub router_info: RouterInfo,
}

/// A send decided by a handler: `len` bytes of the packet buffer starting
/// at `start`, addressed to `dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub dest: SocketAddr,
    pub start: usize,
    pub len: usize,
}

impl Outbound {
    fn full(dest: SocketAddr, len: usize) -> Self {
        Self {
            dest,
            start: 0,
            len,
        }
    }
}

/// Classify by the leading byte, record inbound throughput, and dispatch.
///
/// `draining` is raised during clean shutdown: relay ping/pong are refused
/// so peers stop routing through us, while session traffic keeps flowing.
pub fn handle_packet(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    src: SocketAddr,
    draining: bool,
) -> Option<Outbound> {
    if len == 0 || len > buf.len() {
        return None;
    }

    let packet_type = PacketType::try_from(buf[0]).ok();
    state
        .recorder
        .rx
        .counter(packet_type)
        .add(len + UDP_IPV4_HEADER_BYTES);

    let Some(packet_type) = packet_type else {
        debug!("ignoring packet with unknown type {}", buf[0]);
        return None;
    };

    match packet_type {
        PacketType::RouteRequest => route_request(state, buf, len, src),
        PacketType::RouteResponse => backward_response(state, buf, len, "route response"),
        PacketType::ClientToServer => data_packet(state, buf, len, Direction::ClientToServer),
        PacketType::ServerToClient => data_packet(state, buf, len, Direction::ServerToClient),
        PacketType::SessionPing => session_keepalive(state, buf, len, Direction::ClientToServer),
        PacketType::SessionPong => session_keepalive(state, buf, len, Direction::ServerToClient),
        PacketType::ContinueRequest => continue_request(state, buf, len),
        PacketType::ContinueResponse => backward_response(state, buf, len, "continue response"),
        PacketType::RelayPing => relay_ping(buf, len, src, draining),
        PacketType::RelayPong => relay_pong(state, buf, len, src, draining),
        PacketType::NearPing => near_ping(buf, len, src),
        PacketType::NearPong => {
            debug!("ignoring unexpected near pong from {src}");
            None
        }
    }
}

/// Decrypt the leading route token, install (or refresh) the session, strip
/// the consumed token, and pass the rest of the request down the route.
fn route_request(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    src: SocketAddr,
) -> Option<Outbound> {
    if len < 1 + 2 * ROUTE_TOKEN_BYTES {
        debug!("ignoring route request, bad packet size: {len}");
        return None;
    }

    let mut index = 1;
    let token = match RouteToken::read_encrypted(
        &buf[..len],
        &mut index,
        &state.keychain.backend_public_key,
        &state.keychain.relay_secret_key,
    ) {
        Ok(token) => token,
        Err(err) => {
            error!("ignoring route request, could not read route token: {err}");
            return None;
        }
    };

    if token.expired(state.router_info.current_time()) {
        info!("ignoring route request, token expired");
        return None;
    }

    let Some(next_addr) = token.next_addr else {
        error!("ignoring route request, token has no next hop");
        return None;
    };

    let hash = token.hash();
    match state.sessions.get(hash) {
        None => {
            let session = Session::from_route_token(&token, src, next_addr);
            info!("session created: {session}");
            state.sessions.set(hash, Arc::new(Mutex::new(session)));
        }
        Some(existing) => {
            // idempotent route install: refresh the route, keep counters,
            // replay state, and the key
            let mut session = existing.lock().unwrap();
            session.expire_timestamp = token.expire_timestamp;
            session.prev_addr = src;
            session.next_addr = next_addr;
            debug!("additional route request for session {}", *session);
        }
    }

    // strip the consumed token from the front of the request
    buf[ROUTE_TOKEN_BYTES] = PacketType::RouteRequest as u8;
    Some(Outbound {
        dest: next_addr,
        start: ROUTE_TOKEN_BYTES,
        len: len - ROUTE_TOKEN_BYTES,
    })
}

/// Refresh an existing session's expiry from a continue token, strip the
/// consumed token, and forward the rest.
fn continue_request(state: &HandlerState, buf: &mut [u8], len: usize) -> Option<Outbound> {
    if len < 1 + 2 * CONTINUE_TOKEN_BYTES {
        debug!("ignoring continue request, bad packet size: {len}");
        return None;
    }

    let mut index = 1;
    let token = match ContinueToken::read_encrypted(
        &buf[..len],
        &mut index,
        &state.keychain.backend_public_key,
        &state.keychain.relay_secret_key,
    ) {
        Ok(token) => token,
        Err(err) => {
            error!("ignoring continue request, could not read continue token: {err}");
            return None;
        }
    };

    let now = state.router_info.current_time();
    if token.expired(now) {
        info!("ignoring continue request, token expired");
        return None;
    }

    let hash = token.hash();
    let session = match live_session(state, hash, now) {
        Lookup::Live(session) => session,
        Lookup::Missing => {
            error!("ignoring continue request, session does not exist");
            return None;
        }
        Lookup::Expired => {
            info!("ignoring continue request, session expired");
            return None;
        }
    };

    let next_addr = {
        let mut session = session.lock().unwrap();
        if session.expire_timestamp != token.expire_timestamp {
            info!("session continued: {}", *session);
        }
        session.expire_timestamp = token.expire_timestamp;
        session.next_addr
    };

    buf[CONTINUE_TOKEN_BYTES] = PacketType::ContinueRequest as u8;
    Some(Outbound {
        dest: next_addr,
        start: CONTINUE_TOKEN_BYTES,
        len: len - CONTINUE_TOKEN_BYTES,
    })
}

/// Session data traffic: replay-windowed, verified, forwarded unchanged.
fn data_packet(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    direction: Direction,
) -> Option<Outbound> {
    let label = direction_label(direction);

    if len <= HEADER_BYTES || len > HEADER_BYTES + MTU {
        debug!("ignoring {label} packet, invalid size: {len}");
        return None;
    }

    let mut index = 0;
    let header = match Header::read(&buf[..len], &mut index, direction) {
        Ok(header) => header,
        Err(err) => {
            debug!("ignoring {label} packet, could not read header: {err}");
            return None;
        }
    };

    let now = state.router_info.current_time();
    let session = match live_session(state, header.hash(), now) {
        Lookup::Live(session) => session,
        Lookup::Missing => {
            error!("ignoring {label} packet, session does not exist: {header}");
            return None;
        }
        Lookup::Expired => {
            error!("ignoring {label} packet, session expired: {header}");
            return None;
        }
    };

    let clean_sequence = header.clean_sequence();
    let mut session = session.lock().unwrap();

    let protection = match direction {
        Direction::ClientToServer => &session.client_to_server_protection,
        Direction::ServerToClient => &session.server_to_client_protection,
    };
    if protection.already_received(clean_sequence) {
        debug!("ignoring {label} packet, already received: {}", *session);
        return None;
    }

    if let Err(err) = Header::verify(&buf[..len], 0, direction, &session.private_key) {
        error!("ignoring {label} packet, could not verify header ({err}): {}", *session);
        return None;
    }

    // only after successful verification may the window move
    let dest = match direction {
        Direction::ClientToServer => {
            session.client_to_server_protection.advance(clean_sequence);
            if clean_sequence > session.client_to_server_seq {
                session.client_to_server_seq = clean_sequence;
            }
            session.next_addr
        }
        Direction::ServerToClient => {
            session.server_to_client_protection.advance(clean_sequence);
            if clean_sequence > session.server_to_client_seq {
                session.server_to_client_seq = clean_sequence;
            }
            session.prev_addr
        }
    };

    Some(Outbound::full(dest, len))
}

/// Route/continue responses: an exact header-sized packet flowing back
/// towards the client.
fn backward_response(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    label: &str,
) -> Option<Outbound> {
    if len != HEADER_BYTES {
        debug!("ignoring {label}, invalid size: {len}");
        return None;
    }

    verified_forward(state, buf, len, Direction::ServerToClient, label)
}

/// Session ping/pong: verified and forwarded like data, but guarded by the
/// bare high-water sequence check instead of the replay window.
fn session_keepalive(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    direction: Direction,
) -> Option<Outbound> {
    let label = match direction {
        Direction::ClientToServer => "session ping",
        Direction::ServerToClient => "session pong",
    };

    if len > HEADER_BYTES + 32 {
        debug!("ignoring {label}, packet size too large: {len}");
        return None;
    }

    verified_forward(state, buf, len, direction, label)
}

/// Shared verify-and-forward path for response and keepalive packets.
fn verified_forward(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    direction: Direction,
    label: &str,
) -> Option<Outbound> {
    let mut index = 0;
    let header = match Header::read(&buf[..len], &mut index, direction) {
        Ok(header) => header,
        Err(err) => {
            debug!("ignoring {label}, could not read header: {err}");
            return None;
        }
    };

    let now = state.router_info.current_time();
    let session = match live_session(state, header.hash(), now) {
        Lookup::Live(session) => session,
        Lookup::Missing => {
            error!("ignoring {label}, could not find session: {header}");
            return None;
        }
        Lookup::Expired => {
            error!("ignoring {label}, session expired: {header}");
            return None;
        }
    };

    let clean_sequence = header.clean_sequence();
    let mut session = session.lock().unwrap();

    let last_seen = match direction {
        Direction::ClientToServer => session.client_to_server_seq,
        Direction::ServerToClient => session.server_to_client_seq,
    };
    if clean_sequence <= last_seen {
        debug!(
            "ignoring {label}, already received: {} ({clean_sequence} <= {last_seen})",
            *session
        );
        return None;
    }

    if let Err(err) = Header::verify(&buf[..len], 0, direction, &session.private_key) {
        error!("ignoring {label}, could not verify header ({err}): {}", *session);
        return None;
    }

    let dest = match direction {
        Direction::ClientToServer => {
            session.client_to_server_seq = clean_sequence;
            session.next_addr
        }
        Direction::ServerToClient => {
            session.server_to_client_seq = clean_sequence;
            session.prev_addr
        }
    };

    Some(Outbound::full(dest, len))
}

/// Rewrite a relay ping into a pong and echo it to the sender.
fn relay_ping(buf: &mut [u8], len: usize, src: SocketAddr, draining: bool) -> Option<Outbound> {
    if draining {
        info!("shutting down, ignoring relay ping");
        return None;
    }

    if len != RELAY_PING_PACKET_BYTES {
        debug!("ignoring relay ping, invalid packet size: {len}");
        return None;
    }

    buf[0] = PacketType::RelayPong as u8;
    Some(Outbound::full(src, len))
}

/// Hand a relay pong to the manager so the matching ping slot records its
/// receive time.
fn relay_pong(
    state: &HandlerState,
    buf: &mut [u8],
    len: usize,
    src: SocketAddr,
    draining: bool,
) -> Option<Outbound> {
    if draining {
        info!("shutting down, ignoring relay pong");
        return None;
    }

    if len != RELAY_PING_PACKET_BYTES {
        debug!("ignoring relay pong, invalid packet size: {len}");
        return None;
    }

    let mut index = 1;
    let Ok(sequence) = wire::read_u64(&buf[..len], &mut index) else {
        debug!("ignoring relay pong, could not read sequence");
        return None;
    };

    if !state.relay_manager.process_pong(src, sequence) {
        debug!("ignoring relay pong from unknown peer {src}");
    }
    None
}

/// Echo a near ping back as a pong, dropping the 16 trailing bytes of
/// anti-spoofing material.
fn near_ping(buf: &mut [u8], len: usize, src: SocketAddr) -> Option<Outbound> {
    if len != NEAR_PING_PACKET_BYTES {
        debug!("ignoring near ping, length invalid: {len}");
        return None;
    }

    buf[0] = PacketType::NearPong as u8;
    Some(Outbound::full(src, len - 16))
}

enum Lookup {
    Live(SessionHandle),
    Expired,
    Missing,
}

/// Fetch a session, erasing it (and reporting `Expired`) when its expiry
/// has passed.
fn live_session(state: &HandlerState, hash: u64, current_time: u64) -> Lookup {
    let Some(session) = state.sessions.get(hash) else {
        return Lookup::Missing;
    };

    let expired = session.lock().unwrap().expired(current_time);
    if expired {
        state.sessions.erase(hash);
        return Lookup::Expired;
    }

    Lookup::Live(session)
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToServer => "client to server",
        Direction::ServerToClient => "server to client",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crypto_box::aead::OsRng;
    use crypto_box::{PublicKey, SecretKey};
    use slipstream_crypto::header::sequence_bits;
    use slipstream_crypto::KEY_BYTES;

    const NOW: u64 = 1_700_000_000;
    const SESSION_ID: u64 = 0xABCD;
    const SESSION_VERSION: u8 = 1;
    const SESSION_KEY: u64 = SESSION_ID ^ SESSION_VERSION as u64;

    struct TestEnv {
        state: HandlerState,
        backend_secret: SecretKey,
        session_key: [u8; KEY_BYTES],
    }

    fn client_addr() -> SocketAddr {
        "203.0.113.5:50000".parse().unwrap()
    }

    fn next_hop() -> SocketAddr {
        "10.0.0.2:40000".parse().unwrap()
    }

    fn env() -> TestEnv {
        let backend_secret = SecretKey::generate(&mut OsRng);
        let relay_secret = SecretKey::generate(&mut OsRng);

        let keychain = Keychain {
            relay_public_key: relay_secret.public_key(),
            relay_secret_key: relay_secret,
            backend_public_key: backend_secret.public_key(),
        };

        let state = HandlerState {
            keychain,
            sessions: SessionMap::new(),
            relay_manager: RelayManager::new(),
            recorder: ThroughputRecorder::default(),
            router_info: RouterInfo::new(),
        };
        state.router_info.set_timestamp(NOW);

        TestEnv {
            state,
            backend_secret,
            session_key: [0x5A; KEY_BYTES],
        }
    }

    fn route_token(env: &TestEnv, expire: u64) -> RouteToken {
        RouteToken {
            expire_timestamp: expire,
            session_id: SESSION_ID,
            session_version: SESSION_VERSION,
            kbps_up: 5000,
            kbps_down: 10_000,
            next_addr: Some(next_hop()),
            private_key: env.session_key,
        }
    }

    /// A route request carrying our token followed by the next hop's.
    fn route_request_packet(env: &TestEnv, expire: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 1 + 2 * ROUTE_TOKEN_BYTES];
        buf[0] = PacketType::RouteRequest as u8;

        let mut index = 1;
        route_token(env, expire)
            .write_encrypted(
                &mut buf,
                &mut index,
                &env.backend_secret,
                &env.state.keychain.relay_public_key,
            )
            .unwrap();

        // the trailing token belongs to the next relay; its key is not ours
        let other_relay: PublicKey = SecretKey::generate(&mut OsRng).public_key();
        route_token(env, expire)
            .write_encrypted(&mut buf, &mut index, &env.backend_secret, &other_relay)
            .unwrap();

        buf
    }

    fn install_session(env: &TestEnv) {
        let mut buf = route_request_packet(env, NOW + 60);
        let len = buf.len();
        handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();
    }

    fn signed_packet(
        env: &TestEnv,
        packet_type: PacketType,
        direction: Direction,
        sequence: u64,
        extra: usize,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_BYTES + extra];
        let header = Header {
            packet_type,
            sequence: sequence_bits(packet_type, direction, sequence),
            session_id: SESSION_ID,
            session_version: SESSION_VERSION,
        };
        let mut index = 0;
        header
            .write(&mut buf, &mut index, direction, &env.session_key)
            .unwrap();
        buf
    }

    #[test]
    fn route_install_and_forward() {
        let env = env();
        let mut buf = route_request_packet(&env, NOW + 60);
        let len = buf.len();

        let out = handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        assert_eq!(out.dest, next_hop());
        assert_eq!(out.start, ROUTE_TOKEN_BYTES);
        assert_eq!(out.len, len - ROUTE_TOKEN_BYTES);
        assert_eq!(buf[out.start], PacketType::RouteRequest as u8);

        let session = env.state.sessions.get(SESSION_KEY).expect("session installed");
        let session = session.lock().unwrap();
        assert_eq!(session.session_id, SESSION_ID);
        assert_eq!(session.prev_addr, client_addr());
        assert_eq!(session.next_addr, next_hop());
        assert_eq!(session.client_to_server_seq, 0);
        assert_eq!(session.private_key, env.session_key);
    }

    #[test]
    fn repeated_route_request_does_not_reset_counters() {
        let env = env();
        install_session(&env);

        // some traffic moves the sequence forward
        let mut data = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 5, 10);
        let len = data.len();
        handle_packet(&env.state, &mut data, len, client_addr(), false).unwrap();

        // the same route request again must keep the session state
        let mut buf = route_request_packet(&env, NOW + 120);
        let len = buf.len();
        handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        let session = session.lock().unwrap();
        assert_eq!(session.client_to_server_seq, 5);
        assert_eq!(session.expire_timestamp, NOW + 120);
        assert_eq!(env.state.sessions.len(), 1);
    }

    #[test]
    fn expired_token_is_rejected() {
        let env = env();
        let mut buf = route_request_packet(&env, NOW - 1);
        let len = buf.len();

        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
        assert!(env.state.sessions.is_empty());
    }

    #[test]
    fn token_expiring_exactly_now_is_rejected() {
        let env = env();
        let mut buf = route_request_packet(&env, NOW);
        let len = buf.len();

        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
        assert!(env.state.sessions.is_empty());
    }

    #[test]
    fn short_route_request_is_rejected() {
        let env = env();
        let mut buf = vec![PacketType::RouteRequest as u8; 1 + ROUTE_TOKEN_BYTES];
        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
    }

    #[test]
    fn data_forward_after_install() {
        let env = env();
        install_session(&env);

        let mut buf = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 1, 100);
        let len = buf.len();
        let out = handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        assert_eq!(out, Outbound::full(next_hop(), len));

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        let session = session.lock().unwrap();
        assert_eq!(session.client_to_server_seq, 1);
        assert!(session.client_to_server_protection.already_received(1));
    }

    #[test]
    fn duplicate_data_packet_is_dropped() {
        let env = env();
        install_session(&env);

        let buf = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 1, 100);
        let len = buf.len();

        let mut first = buf.clone();
        assert!(handle_packet(&env.state, &mut first, len, client_addr(), false).is_some());

        let mut replayed = buf;
        assert!(handle_packet(&env.state, &mut replayed, len, client_addr(), false).is_none());

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        assert_eq!(session.lock().unwrap().client_to_server_seq, 1);
    }

    #[test]
    fn bad_tag_does_not_advance_the_replay_window() {
        let env = env();
        install_session(&env);

        let good = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 3, 50);
        let len = good.len();

        let mut tampered = good.clone();
        tampered[HEADER_BYTES - 1] ^= 0xFF;
        assert!(handle_packet(&env.state, &mut tampered, len, client_addr(), false).is_none());

        // the genuine packet with the same sequence must still go through
        let mut intact = good;
        assert!(handle_packet(&env.state, &mut intact, len, client_addr(), false).is_some());
    }

    #[test]
    fn server_to_client_flows_back_to_the_client() {
        let env = env();
        install_session(&env);

        let mut buf = signed_packet(&env, PacketType::ServerToClient, Direction::ServerToClient, 1, 80);
        let len = buf.len();
        let out = handle_packet(&env.state, &mut buf, len, next_hop(), false).unwrap();

        assert_eq!(out, Outbound::full(client_addr(), len));
    }

    #[test]
    fn oversized_data_packet_is_dropped() {
        let env = env();
        install_session(&env);

        let mut buf = signed_packet(
            &env,
            PacketType::ClientToServer,
            Direction::ClientToServer,
            1,
            MTU + 1,
        );
        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
    }

    #[test]
    fn data_for_unknown_session_is_dropped() {
        let env = env();
        let mut buf = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 1, 10);
        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
    }

    #[test]
    fn expired_session_is_erased_on_contact() {
        let env = env();
        install_session(&env);

        env.state.router_info.set_timestamp(NOW + 120);

        let mut buf = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 1, 10);
        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
        assert!(env.state.sessions.is_empty());
    }

    #[test]
    fn route_response_updates_high_water_and_flows_back() {
        let env = env();
        install_session(&env);

        let mut buf = signed_packet(&env, PacketType::RouteResponse, Direction::ServerToClient, 1, 0);
        let len = buf.len();
        assert_eq!(len, HEADER_BYTES);

        let out = handle_packet(&env.state, &mut buf, len, next_hop(), false).unwrap();
        assert_eq!(out, Outbound::full(client_addr(), len));

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        assert_eq!(session.lock().unwrap().server_to_client_seq, 1);

        // stale sequence is refused
        let mut stale = signed_packet(&env, PacketType::RouteResponse, Direction::ServerToClient, 1, 0);
        assert!(handle_packet(&env.state, &mut stale, len, next_hop(), false).is_none());
    }

    #[test]
    fn session_ping_uses_bare_sequence_check() {
        let env = env();
        install_session(&env);

        let mut ping = signed_packet(&env, PacketType::SessionPing, Direction::ClientToServer, 2, 8);
        let len = ping.len();
        let out = handle_packet(&env.state, &mut ping, len, client_addr(), false).unwrap();
        assert_eq!(out, Outbound::full(next_hop(), len));

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        assert_eq!(session.lock().unwrap().client_to_server_seq, 2);

        // an equal sequence is a duplicate under the bare check
        let mut dup = signed_packet(&env, PacketType::SessionPing, Direction::ClientToServer, 2, 8);
        assert!(handle_packet(&env.state, &mut dup, len, client_addr(), false).is_none());
    }

    #[test]
    fn session_pong_flows_back_to_the_client() {
        let env = env();
        install_session(&env);

        let mut pong = signed_packet(&env, PacketType::SessionPong, Direction::ServerToClient, 4, 8);
        let len = pong.len();
        let out = handle_packet(&env.state, &mut pong, len, next_hop(), false).unwrap();
        assert_eq!(out, Outbound::full(client_addr(), len));
    }

    #[test]
    fn oversized_session_ping_is_dropped() {
        let env = env();
        install_session(&env);

        let mut ping = signed_packet(&env, PacketType::SessionPing, Direction::ClientToServer, 2, 33);
        let len = ping.len();
        assert!(handle_packet(&env.state, &mut ping, len, client_addr(), false).is_none());
    }

    #[test]
    fn continue_request_extends_the_session() {
        let env = env();
        install_session(&env);

        let token = ContinueToken {
            expire_timestamp: NOW + 300,
            session_id: SESSION_ID,
            session_version: SESSION_VERSION,
        };

        let mut buf = vec![0u8; 1 + 2 * CONTINUE_TOKEN_BYTES];
        buf[0] = PacketType::ContinueRequest as u8;
        let mut index = 1;
        token
            .write_encrypted(
                &mut buf,
                &mut index,
                &env.backend_secret,
                &env.state.keychain.relay_public_key,
            )
            .unwrap();
        let other_relay = SecretKey::generate(&mut OsRng).public_key();
        token
            .write_encrypted(&mut buf, &mut index, &env.backend_secret, &other_relay)
            .unwrap();

        let len = buf.len();
        let out = handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        assert_eq!(out.dest, next_hop());
        assert_eq!(out.start, CONTINUE_TOKEN_BYTES);
        assert_eq!(out.len, len - CONTINUE_TOKEN_BYTES);
        assert_eq!(buf[out.start], PacketType::ContinueRequest as u8);

        let session = env.state.sessions.get(SESSION_KEY).unwrap();
        assert_eq!(session.lock().unwrap().expire_timestamp, NOW + 300);
    }

    #[test]
    fn continue_request_without_a_session_is_rejected() {
        let env = env();

        let token = ContinueToken {
            expire_timestamp: NOW + 300,
            session_id: SESSION_ID,
            session_version: SESSION_VERSION,
        };
        let mut buf = vec![0u8; 1 + 2 * CONTINUE_TOKEN_BYTES];
        buf[0] = PacketType::ContinueRequest as u8;
        let mut index = 1;
        token
            .write_encrypted(
                &mut buf,
                &mut index,
                &env.backend_secret,
                &env.state.keychain.relay_public_key,
            )
            .unwrap();
        let other_relay = SecretKey::generate(&mut OsRng).public_key();
        token
            .write_encrypted(&mut buf, &mut index, &env.backend_secret, &other_relay)
            .unwrap();

        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), false).is_none());
    }

    #[test]
    fn relay_ping_is_echoed_as_pong() {
        let env = env();
        let mut buf = vec![0u8; RELAY_PING_PACKET_BYTES];
        buf[0] = PacketType::RelayPing as u8;
        let mut index = 1;
        wire::write_u64(&mut buf, &mut index, 0xDEAD).unwrap();

        let len = buf.len();
        let out = handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        assert_eq!(out, Outbound::full(client_addr(), RELAY_PING_PACKET_BYTES));
        assert_eq!(buf[0], PacketType::RelayPong as u8);
        let mut read_index = 1;
        assert_eq!(wire::read_u64(&buf, &mut read_index).unwrap(), 0xDEAD);
    }

    #[test]
    fn relay_ping_of_wrong_size_is_dropped() {
        let env = env();
        let mut buf = vec![PacketType::RelayPing as u8; 10];
        assert!(handle_packet(&env.state, &mut buf, 10, client_addr(), false).is_none());
    }

    #[test]
    fn relay_ping_and_pong_are_refused_while_draining() {
        let env = env();
        let mut ping = vec![0u8; RELAY_PING_PACKET_BYTES];
        ping[0] = PacketType::RelayPing as u8;
        assert!(handle_packet(&env.state, &mut ping, RELAY_PING_PACKET_BYTES, client_addr(), true)
            .is_none());

        let mut pong = vec![0u8; RELAY_PING_PACKET_BYTES];
        pong[0] = PacketType::RelayPong as u8;
        assert!(handle_packet(&env.state, &mut pong, RELAY_PING_PACKET_BYTES, client_addr(), true)
            .is_none());
    }

    #[test]
    fn data_still_flows_while_draining() {
        let env = env();
        install_session(&env);

        let mut buf = signed_packet(&env, PacketType::ClientToServer, Direction::ClientToServer, 1, 10);
        let len = buf.len();
        assert!(handle_packet(&env.state, &mut buf, len, client_addr(), true).is_some());
    }

    #[test]
    fn near_ping_is_echoed_with_spoofing_material_stripped() {
        let env = env();
        let mut buf = vec![0u8; NEAR_PING_PACKET_BYTES];
        buf[0] = PacketType::NearPing as u8;

        let len = buf.len();
        let out = handle_packet(&env.state, &mut buf, len, client_addr(), false).unwrap();

        assert_eq!(out, Outbound::full(client_addr(), NEAR_PING_PACKET_BYTES - 16));
        assert_eq!(buf[0], PacketType::NearPong as u8);
    }

    #[test]
    fn unknown_type_is_counted_and_dropped() {
        let env = env();
        let mut buf = vec![99u8; 20];
        assert!(handle_packet(&env.state, &mut buf, 20, client_addr(), false).is_none());
        assert_eq!(env.state.recorder.rx.counter(None).packets(), 1);
    }

    #[test]
    fn inbound_throughput_includes_udp_overhead() {
        let env = env();
        let mut buf = route_request_packet(&env, NOW + 60);
        let len = buf.len();
        handle_packet(&env.state, &mut buf, len, client_addr(), false);

        let counter = env
            .state
            .recorder
            .rx
            .counter(Some(PacketType::RouteRequest));
        assert_eq!(counter.bytes(), (len + UDP_IPV4_HEADER_BYTES) as u64);
    }
}
