//! Backend control-plane loop.
//!
//! Two phases. Init: announce ourselves to the backend, prove key ownership
//! with a crypto_box-sealed token, and adopt the backend's clock. Update:
//! once per second, report ping stats, session count, traffic totals, and
//! system usage; the response refreshes the clock and replaces the peer
//! relay set. Sustained update failure is fatal - supervisors restart the
//! process on a non-zero exit.
//!
//! Both endpoints speak the little-endian binary codec, not JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use crypto_box::aead::Aead;
use crypto_box::{Nonce, SalsaBox};
use rand::RngCore;
use slipstream_crypto::KEY_BYTES;
use slipstream_proto::{wire, MAX_RELAYS};
use sysinfo::{CpuExt, System, SystemExt};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::handlers::HandlerState;
use crate::relay_manager::{RelayEndpoint, RelayStats};
use crate::shutdown::Shutdown;

pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

const INIT_REQUEST_MAGIC: u32 = 0x736C_6970; // "slip"
const INIT_REQUEST_VERSION: u32 = 1;
const INIT_RESPONSE_VERSION: u32 = 0;
const UPDATE_REQUEST_VERSION: u32 = 5;
const UPDATE_RESPONSE_VERSION: u32 = 0;

/// Consecutive failed updates tolerated before the loop gives up.
const MAX_UPDATE_ATTEMPTS: u32 = 10;

/// Wall-clock budget without a successful update.
const UPDATE_DEADLINE: Duration = Duration::from_secs(30);

/// How long to keep reporting `shutting_down` during a clean drain.
const DRAIN_UPDATE_BUDGET: u32 = 60;

/// Grace period after a successful shutdown report, letting upstream
/// routing move sessions off this relay.
const DRAIN_SLEEP: Duration = Duration::from_secs(30);

const INIT_NONCE_BYTES: usize = 24;
const INIT_TOKEN_BYTES: usize = 32;
const INIT_TOKEN_SEALED_BYTES: usize = INIT_TOKEN_BYTES + 16;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("shutdown requested before the backend handshake completed")]
    InitAborted,

    #[error("no successful update after {MAX_UPDATE_ATTEMPTS} consecutive attempts")]
    TooManyFailures,

    #[error("no successful update for {} seconds", UPDATE_DEADLINE.as_secs())]
    Deadline,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error("unable to parse relay address: {0}")]
    InvalidRelayAddress(String),
}

/// POST /relay_init body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    pub magic: u32,
    pub version: u32,
    pub nonce: [u8; INIT_NONCE_BYTES],
    pub address: String,
    pub encrypted_token: [u8; INIT_TOKEN_SEALED_BYTES],
    pub relay_version: String,
}

impl InitRequest {
    fn size(&self) -> usize {
        4 + 4
            + INIT_NONCE_BYTES
            + 4
            + self.address.len()
            + INIT_TOKEN_SEALED_BYTES
            + 4
            + self.relay_version.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.size()];
        let mut index = 0;
        wire::write_u32(&mut buf, &mut index, self.magic)?;
        wire::write_u32(&mut buf, &mut index, self.version)?;
        wire::write_bytes(&mut buf, &mut index, &self.nonce)?;
        wire::write_string(&mut buf, &mut index, &self.address)?;
        wire::write_bytes(&mut buf, &mut index, &self.encrypted_token)?;
        wire::write_string(&mut buf, &mut index, &self.relay_version)?;
        Ok(buf)
    }

    #[cfg(test)]
    fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        let mut index = 0;
        let magic = wire::read_u32(buf, &mut index)?;
        let version = wire::read_u32(buf, &mut index)?;
        let mut nonce = [0u8; INIT_NONCE_BYTES];
        wire::read_bytes(buf, &mut index, &mut nonce)?;
        let address = wire::read_string(buf, &mut index)?;
        let mut encrypted_token = [0u8; INIT_TOKEN_SEALED_BYTES];
        wire::read_bytes(buf, &mut index, &mut encrypted_token)?;
        let relay_version = wire::read_string(buf, &mut index)?;
        Ok(Self {
            magic,
            version,
            nonce,
            address,
            encrypted_token,
            relay_version,
        })
    }
}

/// /relay_init response: timestamp in milliseconds plus the key to present
/// on subsequent updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    pub version: u32,
    pub timestamp_ms: u64,
    pub public_key: [u8; KEY_BYTES],
}

impl InitResponse {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        let mut index = 0;
        let version = wire::read_u32(buf, &mut index)?;
        let timestamp_ms = wire::read_u64(buf, &mut index)?;
        let mut public_key = [0u8; KEY_BYTES];
        wire::read_bytes(buf, &mut index, &mut public_key)?;
        Ok(Self {
            version,
            timestamp_ms,
            public_key,
        })
    }

    #[cfg(test)]
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; 4 + 8 + KEY_BYTES];
        let mut index = 0;
        wire::write_u32(&mut buf, &mut index, self.version)?;
        wire::write_u64(&mut buf, &mut index, self.timestamp_ms)?;
        wire::write_bytes(&mut buf, &mut index, &self.public_key)?;
        Ok(buf)
    }
}

/// POST /relay_update body.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub version: u32,
    pub address: String,
    pub public_key: [u8; KEY_BYTES],
    pub ping_stats: Vec<RelayStats>,
    pub session_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub shutting_down: bool,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub relay_version: String,
}

impl UpdateRequest {
    fn size(&self) -> usize {
        4 + 4
            + self.address.len()
            + KEY_BYTES
            + 4
            + self.ping_stats.len() * 20
            + 8
            + 8
            + 8
            + 1
            + 8
            + 8
            + 4
            + self.relay_version.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.size()];
        let mut index = 0;
        wire::write_u32(&mut buf, &mut index, self.version)?;
        wire::write_string(&mut buf, &mut index, &self.address)?;
        wire::write_bytes(&mut buf, &mut index, &self.public_key)?;
        wire::write_u32(&mut buf, &mut index, self.ping_stats.len() as u32)?;
        for stats in &self.ping_stats {
            wire::write_u64(&mut buf, &mut index, stats.id)?;
            wire::write_f32(&mut buf, &mut index, stats.rtt)?;
            wire::write_f32(&mut buf, &mut index, stats.jitter)?;
            wire::write_f32(&mut buf, &mut index, stats.packet_loss)?;
        }
        wire::write_u64(&mut buf, &mut index, self.session_count)?;
        wire::write_u64(&mut buf, &mut index, self.bytes_sent)?;
        wire::write_u64(&mut buf, &mut index, self.bytes_received)?;
        wire::write_u8(&mut buf, &mut index, u8::from(self.shutting_down))?;
        wire::write_f64(&mut buf, &mut index, self.cpu_usage)?;
        wire::write_f64(&mut buf, &mut index, self.mem_usage)?;
        wire::write_string(&mut buf, &mut index, &self.relay_version)?;
        Ok(buf)
    }

    #[cfg(test)]
    fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        let mut index = 0;
        let version = wire::read_u32(buf, &mut index)?;
        let address = wire::read_string(buf, &mut index)?;
        let mut public_key = [0u8; KEY_BYTES];
        wire::read_bytes(buf, &mut index, &mut public_key)?;

        let num_relays = wire::read_u32(buf, &mut index)?;
        let mut ping_stats = Vec::with_capacity(num_relays as usize);
        for _ in 0..num_relays {
            ping_stats.push(RelayStats {
                id: wire::read_u64(buf, &mut index)?,
                rtt: wire::read_f32(buf, &mut index)?,
                jitter: wire::read_f32(buf, &mut index)?,
                packet_loss: wire::read_f32(buf, &mut index)?,
            });
        }

        let session_count = wire::read_u64(buf, &mut index)?;
        let bytes_sent = wire::read_u64(buf, &mut index)?;
        let bytes_received = wire::read_u64(buf, &mut index)?;
        let shutting_down = wire::read_u8(buf, &mut index)? != 0;
        let cpu_usage = wire::read_f64(buf, &mut index)?;
        let mem_usage = wire::read_f64(buf, &mut index)?;
        let relay_version = wire::read_string(buf, &mut index)?;

        Ok(Self {
            version,
            address,
            public_key,
            ping_stats,
            session_count,
            bytes_sent,
            bytes_received,
            shutting_down,
            cpu_usage,
            mem_usage,
            relay_version,
        })
    }
}

/// /relay_update response: a fresh timestamp (seconds) and the peer relay
/// set to ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResponse {
    pub version: u32,
    pub timestamp: u64,
    pub relays: Vec<RelayEndpoint>,
}

impl UpdateResponse {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        let mut index = 0;
        let version = wire::read_u32(buf, &mut index)?;
        let timestamp = wire::read_u64(buf, &mut index)?;

        let num_relays = wire::read_u32(buf, &mut index)?;
        let mut relays = Vec::with_capacity((num_relays as usize).min(MAX_RELAYS));
        for _ in 0..num_relays {
            let id = wire::read_u64(buf, &mut index)?;
            let address = wire::read_string(buf, &mut index)?;
            let addr: SocketAddr = address
                .parse()
                .map_err(|_| CodecError::InvalidRelayAddress(address))?;
            relays.push(RelayEndpoint { id, addr });
        }

        Ok(Self {
            version,
            timestamp,
            relays,
        })
    }

    #[cfg(test)]
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let size = 4
            + 8
            + 4
            + self
                .relays
                .iter()
                .map(|relay| 8 + 4 + relay.addr.to_string().len())
                .sum::<usize>();
        let mut buf = vec![0u8; size];
        let mut index = 0;
        wire::write_u32(&mut buf, &mut index, self.version)?;
        wire::write_u64(&mut buf, &mut index, self.timestamp)?;
        wire::write_u32(&mut buf, &mut index, self.relays.len() as u32)?;
        for relay in &self.relays {
            wire::write_u64(&mut buf, &mut index, relay.id)?;
            wire::write_string(&mut buf, &mut index, &relay.addr.to_string())?;
        }
        Ok(buf)
    }
}

pub struct Backend {
    hostname: String,
    relay_address: String,
    state: Arc<HandlerState>,
    shutdown: Arc<Shutdown>,
    http: reqwest::Client,
    /// Key presented on updates; the real backend replaces it at init.
    update_key: [u8; KEY_BYTES],
    system: System,
}

impl Backend {
    pub fn new(
        hostname: String,
        relay_address: String,
        state: Arc<HandlerState>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let update_key = *state.keychain.relay_public_key.as_bytes();
        Self {
            hostname,
            relay_address,
            state,
            shutdown,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("default reqwest client"),
            update_key,
            system: System::new(),
        }
    }

    /// Init, then update once per second until shutdown; on a clean
    /// shutdown request, drain before returning.
    pub async fn run(&mut self) -> Result<(), BackendError> {
        self.init_phase().await?;
        let result = self.update_phase().await;
        if self.shutdown.clean_requested() {
            self.drain().await;
        }
        result
    }

    async fn init_phase(&mut self) -> Result<(), BackendError> {
        loop {
            if !self.shutdown.alive() {
                return Err(BackendError::InitAborted);
            }
            match self.init().await {
                Ok(()) => {
                    info!("relay initialized with backend");
                    return Ok(());
                }
                Err(err) => warn!("relay init failed: {err:#}"),
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn init(&mut self) -> anyhow::Result<()> {
        let mut nonce = [0u8; INIT_NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        // just has to be something the backend can open with our public key
        let mut token = [0u8; INIT_TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut token);

        let envelope = SalsaBox::new(
            &self.state.keychain.backend_public_key,
            &self.state.keychain.relay_secret_key,
        );
        let sealed = envelope
            .encrypt(&Nonce::from(nonce), &token[..])
            .map_err(|_| anyhow!("could not seal init token"))?;
        let encrypted_token: [u8; INIT_TOKEN_SEALED_BYTES] = sealed
            .try_into()
            .map_err(|_| anyhow!("unexpected sealed token size"))?;

        let request = InitRequest {
            magic: INIT_REQUEST_MAGIC,
            version: INIT_REQUEST_VERSION,
            nonce,
            address: self.relay_address.clone(),
            encrypted_token,
            relay_version: RELAY_VERSION.to_owned(),
        };

        let body = self.post("/relay_init", request.to_bytes()?).await?;
        let response = InitResponse::from_bytes(&body).context("bad init response")?;
        if response.version != INIT_RESPONSE_VERSION {
            bail!(
                "bad init response version: expected {INIT_RESPONSE_VERSION}, got {}",
                response.version
            );
        }

        // the backend reports milliseconds; router time runs in seconds
        self.state
            .router_info
            .set_timestamp(response.timestamp_ms / 1000);
        self.update_key = response.public_key;
        Ok(())
    }

    async fn update_phase(&mut self) -> Result<(), BackendError> {
        let mut failures = 0u32;
        let mut last_success = Instant::now();

        while self.shutdown.alive() {
            match self.update(false).await {
                Ok(()) => {
                    failures = 0;
                    last_success = Instant::now();
                }
                Err(err) => {
                    failures += 1;
                    if failures >= MAX_UPDATE_ATTEMPTS {
                        error!("could not update relay, max attempts reached: {err:#}");
                        return Err(BackendError::TooManyFailures);
                    }
                    if last_success.elapsed() >= UPDATE_DEADLINE {
                        error!(
                            "could not update relay for over {} seconds: {err:#}",
                            UPDATE_DEADLINE.as_secs()
                        );
                        return Err(BackendError::Deadline);
                    }
                    warn!("could not update relay (attempt {failures}): {err:#}");
                }
            }
            sleep(Duration::from_secs(1)).await;
        }

        Ok(())
    }

    /// Keep reporting `shutting_down` until the backend hears us (bounded),
    /// then sit out the grace period while routes move away.
    async fn drain(&mut self) {
        info!("clean shutdown: reporting drain to backend");

        let mut reported = false;
        for _ in 0..DRAIN_UPDATE_BUDGET {
            if self.update(true).await.is_ok() {
                reported = true;
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }

        if reported {
            info!(
                "drain reported; sleeping {}s before exit",
                DRAIN_SLEEP.as_secs()
            );
            sleep(DRAIN_SLEEP).await;
        }
    }

    async fn update(&mut self, shutting_down: bool) -> anyhow::Result<()> {
        let ping_stats = self.state.relay_manager.stats();
        let session_count = self.state.sessions.len() as u64;
        let (bytes_sent, bytes_received) = self.state.recorder.take_totals();

        self.system.refresh_cpu();
        self.system.refresh_memory();
        let cpu_usage = f64::from(self.system.global_cpu_info().cpu_usage());
        let mem_usage = if self.system.total_memory() > 0 {
            self.system.used_memory() as f64 * 100.0 / self.system.total_memory() as f64
        } else {
            0.0
        };

        let request = UpdateRequest {
            version: UPDATE_REQUEST_VERSION,
            address: self.relay_address.clone(),
            public_key: self.update_key,
            ping_stats,
            session_count,
            bytes_sent,
            bytes_received,
            shutting_down,
            cpu_usage,
            mem_usage,
            relay_version: RELAY_VERSION.to_owned(),
        };

        let body = self.post("/relay_update", request.to_bytes()?).await?;

        // while draining the response carries nothing we still need
        if shutting_down {
            return Ok(());
        }

        let response = UpdateResponse::from_bytes(&body).context("bad update response")?;
        if response.version != UPDATE_RESPONSE_VERSION {
            bail!(
                "bad update response version: expected {UPDATE_RESPONSE_VERSION}, got {}",
                response.version
            );
        }
        if response.relays.len() > MAX_RELAYS {
            bail!("too many relays to ping: {}", response.relays.len());
        }

        self.state.router_info.set_timestamp(response.timestamp);
        self.state.relay_manager.update(&response.relays);

        let purged = self
            .state
            .sessions
            .purge(self.state.router_info.current_time());
        if purged > 0 {
            debug!("purged {purged} expired sessions");
        }

        Ok(())
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}{}", self.hostname, path);
        let response = self
            .http
            .post(&url)
            .body(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("request to {url} rejected"))?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_round_trip() {
        let request = InitRequest {
            magic: INIT_REQUEST_MAGIC,
            version: INIT_REQUEST_VERSION,
            nonce: [7u8; INIT_NONCE_BYTES],
            address: "203.0.113.9:40000".to_owned(),
            encrypted_token: [9u8; INIT_TOKEN_SEALED_BYTES],
            relay_version: RELAY_VERSION.to_owned(),
        };

        let bytes = request.to_bytes().unwrap();
        assert_eq!(InitRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn init_response_round_trip() {
        let response = InitResponse {
            version: INIT_RESPONSE_VERSION,
            timestamp_ms: 1_700_000_000_123,
            public_key: [3u8; KEY_BYTES],
        };

        let bytes = response.to_bytes().unwrap();
        assert_eq!(InitResponse::from_bytes(&bytes).unwrap(), response);
    }

    #[test]
    fn update_request_round_trip() {
        let request = UpdateRequest {
            version: UPDATE_REQUEST_VERSION,
            address: "203.0.113.9:40000".to_owned(),
            public_key: [1u8; KEY_BYTES],
            ping_stats: vec![
                RelayStats {
                    id: 11,
                    rtt: 32.5,
                    jitter: 1.25,
                    packet_loss: 0.0,
                },
                RelayStats {
                    id: 12,
                    rtt: 80.0,
                    jitter: 4.0,
                    packet_loss: 12.5,
                },
            ],
            session_count: 42,
            bytes_sent: 1_000_000,
            bytes_received: 2_000_000,
            shutting_down: true,
            cpu_usage: 12.5,
            mem_usage: 31.0,
            relay_version: RELAY_VERSION.to_owned(),
        };

        let bytes = request.to_bytes().unwrap();
        let decoded = UpdateRequest::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.version, request.version);
        assert_eq!(decoded.address, request.address);
        assert_eq!(decoded.public_key, request.public_key);
        assert_eq!(decoded.ping_stats.len(), 2);
        assert_eq!(decoded.ping_stats[1].id, 12);
        assert_eq!(decoded.ping_stats[1].packet_loss, 12.5);
        assert_eq!(decoded.session_count, 42);
        assert_eq!(decoded.bytes_sent, 1_000_000);
        assert_eq!(decoded.bytes_received, 2_000_000);
        assert!(decoded.shutting_down);
        assert_eq!(decoded.cpu_usage, 12.5);
        assert_eq!(decoded.mem_usage, 31.0);
        assert_eq!(decoded.relay_version, request.relay_version);
    }

    #[test]
    fn update_response_round_trip() {
        let response = UpdateResponse {
            version: UPDATE_RESPONSE_VERSION,
            timestamp: 1_700_000_111,
            relays: vec![
                RelayEndpoint {
                    id: 1,
                    addr: "10.1.0.1:40000".parse().unwrap(),
                },
                RelayEndpoint {
                    id: 2,
                    addr: "[2001:db8::7]:40001".parse().unwrap(),
                },
            ],
        };

        let bytes = response.to_bytes().unwrap();
        assert_eq!(UpdateResponse::from_bytes(&bytes).unwrap(), response);
    }

    #[test]
    fn unparseable_relay_address_is_an_error() {
        let response = UpdateResponse {
            version: UPDATE_RESPONSE_VERSION,
            timestamp: 1,
            relays: vec![],
        };
        let mut bytes = response.to_bytes().unwrap();

        // claim one relay whose address is garbage
        let mut index = 4 + 8;
        wire::write_u32(&mut bytes, &mut index, 1).unwrap();
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"abc");

        assert!(matches!(
            UpdateResponse::from_bytes(&bytes).unwrap_err(),
            CodecError::InvalidRelayAddress(_)
        ));
    }

    #[test]
    fn update_request_is_little_endian_on_the_wire() {
        let request = UpdateRequest {
            version: 5,
            address: String::new(),
            public_key: [0u8; KEY_BYTES],
            ping_stats: vec![],
            session_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
            shutting_down: false,
            cpu_usage: 0.0,
            mem_usage: 0.0,
            relay_version: String::new(),
        };

        let bytes = request.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[5, 0, 0, 0]);
    }
}
