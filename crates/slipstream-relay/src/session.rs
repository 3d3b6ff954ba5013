//! Session state and the shared session table.
//!
//! A session is installed by a route token and addressed by
//! `session_id ^ session_version`. The table is sharded by hash so the
//! receive workers don't contend on one lock; entries are reference-counted
//! so a handle obtained from `get` stays valid even if the entry is erased
//! underneath it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use slipstream_crypto::token::RouteToken;
use slipstream_crypto::{ReplayProtection, KEY_BYTES};

/// Bidirectional relay state for one routed session.
#[derive(Debug)]
pub struct Session {
    pub session_id: u64,
    pub session_version: u8,
    pub expire_timestamp: u64,
    pub client_to_server_seq: u64,
    pub server_to_client_seq: u64,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub prev_addr: SocketAddr,
    pub next_addr: SocketAddr,
    pub private_key: [u8; KEY_BYTES],
    pub client_to_server_protection: ReplayProtection,
    pub server_to_client_protection: ReplayProtection,
}

impl Session {
    /// Build a fresh session from a decrypted route token. `prev_addr` is
    /// the packet source, `next_addr` the token's next hop.
    pub fn from_route_token(
        token: &RouteToken,
        prev_addr: SocketAddr,
        next_addr: SocketAddr,
    ) -> Self {
        Self {
            session_id: token.session_id,
            session_version: token.session_version,
            expire_timestamp: token.expire_timestamp,
            client_to_server_seq: 0,
            server_to_client_seq: 0,
            kbps_up: token.kbps_up,
            kbps_down: token.kbps_down,
            prev_addr,
            next_addr,
            private_key: token.private_key,
            client_to_server_protection: ReplayProtection::new(),
            server_to_client_protection: ReplayProtection::new(),
        }
    }

    #[allow(dead_code)]
    pub fn hash(&self) -> u64 {
        self.session_id ^ u64::from(self.session_version)
    }

    pub fn expired(&self, current_time: u64) -> bool {
        self.expire_timestamp <= current_time
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{}", self.session_id, self.session_version)
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

const SHARD_COUNT: usize = 16;

/// Concurrent map from session hash to shared session state.
pub struct SessionMap {
    shards: [Mutex<HashMap<u64, SessionHandle>>; SHARD_COUNT],
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, key: u64) -> &Mutex<HashMap<u64, SessionHandle>> {
        &self.shards[(key as usize) & (SHARD_COUNT - 1)]
    }

    pub fn get(&self, key: u64) -> Option<SessionHandle> {
        self.shard(key).lock().unwrap().get(&key).cloned()
    }

    pub fn set(&self, key: u64, session: SessionHandle) {
        self.shard(key).lock().unwrap().insert(key, session);
    }

    pub fn erase(&self, key: u64) -> bool {
        self.shard(key).lock().unwrap().remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().len())
            .sum()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge(&self, current_time: u64) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.lock().unwrap();
            entries.retain(|_, session| {
                let keep = !session.lock().unwrap().expired(current_time);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }
}
