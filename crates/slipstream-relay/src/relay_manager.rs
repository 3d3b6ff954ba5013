//! The set of peer relays this relay measures.
//!
//! The backend replaces the peer set on every update. Peers that survive an
//! update keep their ping-history slot; departed peers free theirs; new
//! peers get a cleared slot. All state sits behind one mutex - the critical
//! sections are short and bounded by `MAX_RELAYS`.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use slipstream_proto::{MAX_RELAYS, PING_PERIOD, PING_SAFETY, STATS_WINDOW};

use crate::ping_history::{PingHistory, RouteStats};

/// Peers that have never been pinged sort as long overdue.
const INVALID_PING_TIME: f64 = -10_000.0;

/// A peer relay as announced by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub id: u64,
    pub addr: SocketAddr,
}

/// One relay ping to emit: where, and with which history sequence.
#[derive(Debug, Clone, Copy)]
pub struct PingTarget {
    pub sequence: u64,
    pub addr: SocketAddr,
}

/// Per-peer stats reported to the backend.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub id: u64,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

#[derive(Debug)]
struct Peer {
    id: u64,
    addr: SocketAddr,
    last_ping_time: f64,
    slot: usize,
}

#[derive(Debug)]
struct Inner {
    peers: Vec<Peer>,
    histories: Vec<PingHistory>,
}

#[derive(Debug)]
pub struct RelayManager {
    inner: Mutex<Inner>,
    clock: Instant,
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                peers: Vec::new(),
                histories: vec![PingHistory::new(); MAX_RELAYS],
            }),
            clock: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    /// Replace the peer set. Survivors keep their history slot; new peers
    /// take a cleared one. Ping times are spread evenly across the ping
    /// period so updates don't synchronize ping bursts.
    pub fn update(&self, incoming: &[RelayEndpoint]) {
        self.update_at(incoming, self.now());
    }

    fn update_at(&self, incoming: &[RelayEndpoint], now: f64) {
        let incoming = &incoming[..incoming.len().min(MAX_RELAYS)];

        let mut inner = self.inner.lock().unwrap();
        let Inner { peers, histories } = &mut *inner;

        let mut slot_taken = [false; MAX_RELAYS];
        let mut found = vec![false; incoming.len()];
        let mut next: Vec<Peer> = Vec::with_capacity(incoming.len());

        // carry over peers that are still in the new set
        for peer in peers.drain(..) {
            if let Some(j) = incoming
                .iter()
                .position(|relay| relay.id == peer.id)
            {
                if !found[j] {
                    found[j] = true;
                    slot_taken[peer.slot] = true;
                    next.push(peer);
                }
            }
        }

        // new peers take a free, cleared history slot
        for (j, relay) in incoming.iter().enumerate() {
            if found[j] {
                continue;
            }
            let slot = slot_taken
                .iter()
                .position(|taken| !taken)
                .expect("peer count is bounded by MAX_RELAYS");
            slot_taken[slot] = true;
            histories[slot].clear();
            next.push(Peer {
                id: relay.id,
                addr: relay.addr,
                last_ping_time: INVALID_PING_TIME,
                slot,
            });
        }

        // spread ping times evenly across the period
        let count = next.len();
        for (i, peer) in next.iter_mut().enumerate() {
            peer.last_ping_time = now - PING_PERIOD + i as f64 * PING_PERIOD / count as f64;
        }

        *peers = next;
    }

    /// Record a pong from `from`. Returns false if no peer has that address.
    pub fn process_pong(&self, from: SocketAddr, sequence: u64) -> bool {
        self.process_pong_at(from, sequence, self.now())
    }

    fn process_pong_at(&self, from: SocketAddr, sequence: u64, now: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner { peers, histories } = &mut *inner;

        for peer in peers.iter() {
            if peer.addr == from {
                histories[peer.slot].pong_received(sequence, now);
                return true;
            }
        }
        false
    }

    /// Collect the peers due for a ping, allocating a history sequence for
    /// each and resetting their timers.
    pub fn ping_targets(&self) -> Vec<PingTarget> {
        self.ping_targets_at(self.now())
    }

    fn ping_targets_at(&self, now: f64) -> Vec<PingTarget> {
        let mut inner = self.inner.lock().unwrap();
        let Inner { peers, histories } = &mut *inner;

        let mut targets = Vec::new();
        for peer in peers.iter_mut() {
            if peer.last_ping_time + PING_PERIOD <= now {
                targets.push(PingTarget {
                    sequence: histories[peer.slot].ping_sent(now),
                    addr: peer.addr,
                });
                peer.last_ping_time = now;
            }
        }
        targets
    }

    /// Per-peer route stats over the trailing stats window.
    pub fn stats(&self) -> Vec<RelayStats> {
        self.stats_at(self.now())
    }

    fn stats_at(&self, now: f64) -> Vec<RelayStats> {
        let inner = self.inner.lock().unwrap();

        inner
            .peers
            .iter()
            .map(|peer| {
                let stats = RouteStats::from_history(
                    &inner.histories[peer.slot],
                    now - STATS_WINDOW,
                    now,
                    PING_SAFETY,
                );
                RelayStats {
                    id: peer.id,
                    rtt: stats.rtt,
                    jitter: stats.jitter,
                    packet_loss: stats.packet_loss,
                }
            })
            .collect()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn last_ping_times(&self) -> Vec<f64> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .iter()
            .map(|peer| peer.last_ping_time)
            .collect()
    }
}
