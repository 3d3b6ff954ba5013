#![forbid(unsafe_code)]

//! Slipstream relay daemon.
//!
//! Forwards authenticated UDP traffic along backend-issued routes:
//! 1. Route tokens install sessions; data packets are verified against
//!    per-session keys and replay windows, then forwarded to the next hop.
//! 2. Peer relays are pinged continuously to measure route quality.
//! 3. A control-plane loop reports telemetry to the backend once per second
//!    and receives the peer set in return.

mod backend;
mod handlers;
mod ping_history;
mod pinger;
mod recv;
mod relay_manager;
mod router_info;
mod session;
mod shutdown;
mod socket;
mod throughput;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use slipstream_crypto::Keychain;
use tracing::{error, info};

use crate::backend::Backend;
use crate::handlers::HandlerState;
use crate::relay_manager::RelayManager;
use crate::router_info::RouterInfo;
use crate::session::SessionMap;
use crate::shutdown::Shutdown;
use crate::throughput::ThroughputRecorder;

#[derive(Parser, Debug)]
#[command(name = "slipstream-relay", version)]
#[command(about = "Slipstream relay - forwards authenticated UDP traffic along backend-issued routes")]
struct Args {
    /// UDP bind address
    #[arg(long, env = "RELAY_ADDRESS", default_value = "127.0.0.1:40000")]
    address: SocketAddr,

    /// Relay public key (base64 X25519)
    #[arg(long, env = "RELAY_PUBLIC_KEY")]
    public_key: String,

    /// Relay private key (base64 X25519)
    #[arg(long, env = "RELAY_PRIVATE_KEY")]
    private_key: String,

    /// Backend public key (base64 X25519)
    #[arg(long, env = "RELAY_BACKEND_PUBLIC_KEY")]
    backend_public_key: String,

    /// Backend base URL
    #[arg(long, env = "RELAY_BACKEND_HOSTNAME", default_value = "http://localhost:30000")]
    backend_hostname: String,

    /// Cap on cores used for packet processing; defaults to autodetection
    #[arg(long, env = "RELAY_MAX_CORES")]
    max_cores: Option<usize>,

    /// Socket send buffer size in bytes
    #[arg(long, env = "RELAY_SEND_BUFFER_SIZE", default_value_t = 1_000_000)]
    send_buffer_size: usize,

    /// Socket receive buffer size in bytes
    #[arg(long, env = "RELAY_RECV_BUFFER_SIZE", default_value_t = 1_000_000)]
    recv_buffer_size: usize,

    /// Log level
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = format!("{},hyper=warn,reqwest=warn", args.log_level);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("slipstream relay v{}", backend::RELAY_VERSION);

    // exit code 0 is reserved for a successful clean shutdown; supervisors
    // restart the service on anything else
    match run(args).await {
        Ok(()) => {
            info!("all done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let keychain = Keychain::from_base64(
        &args.public_key,
        &args.private_key,
        &args.backend_public_key,
    )
    .context("invalid key material")?;

    info!("relay address is {}", args.address);
    info!("backend hostname is {}", args.backend_hostname);

    let workers = worker_count(args.max_cores);
    info!("spawning {workers} receive workers");

    let state = Arc::new(HandlerState {
        keychain,
        sessions: SessionMap::new(),
        relay_manager: RelayManager::new(),
        recorder: ThroughputRecorder::default(),
        router_info: RouterInfo::new(),
    });
    let shutdown = Arc::new(Shutdown::new());

    // every worker gets its own reuse-port socket on the same address
    let mut sockets = Vec::with_capacity(workers);
    for _ in 0..workers {
        let socket = socket::bind_udp(args.address, args.send_buffer_size, args.recv_buffer_size)
            .context("could not create relay socket")?;
        sockets.push(Arc::new(socket));
    }

    let mut recv_tasks = Vec::with_capacity(workers);
    for socket in &sockets {
        recv_tasks.push(tokio::spawn(recv::recv_loop(
            socket.clone(),
            state.clone(),
            shutdown.clone(),
        )));
    }

    tokio::spawn(pinger::ping_loop(
        sockets[0].clone(),
        state.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(shutdown::watch_signals(shutdown.clone()));

    let mut backend = Backend::new(
        args.backend_hostname,
        args.address.to_string(),
        state.clone(),
        shutdown.clone(),
    );
    let backend_result = backend.run().await;

    shutdown.stop_receiving();

    if let Err(err) = backend_result {
        bail!("backend loop failed: {err}");
    }
    if !shutdown.clean_requested() {
        bail!("hard shutdown");
    }

    info!("clean shutdown, joining receive workers");
    for task in recv_tasks {
        let _ = task.await;
    }

    Ok(())
}

/// One receive worker per core, with one core left for the pinger and the
/// backend loop when there is more than one to go around.
fn worker_count(max_cores: Option<usize>) -> usize {
    let cores = max_cores.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1)
    });
    cores.saturating_sub(1).max(1)
}
