//! Process lifecycle flags and signal routing.
//!
//! SIGINT is a hard shutdown: everything stops and the process exits
//! non-zero. SIGTERM and SIGHUP request a clean shutdown: the pinger stops
//! and relay ping/pong are refused (so peers route around us), while session
//! traffic keeps flowing until the backend loop finishes draining. A second
//! signal of any kind exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct Shutdown {
    alive: AtomicBool,
    clean: AtomicBool,
    receiving: AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            clean: AtomicBool::new(false),
            receiving: AtomicBool::new(true),
        }
    }

    /// False once any shutdown has been requested.
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// True when the operator asked for a graceful drain.
    pub fn clean_requested(&self) -> bool {
        self.clean.load(Ordering::Relaxed)
    }

    /// True while receive loops should keep serving packets.
    pub fn receiving(&self) -> bool {
        self.receiving.load(Ordering::Relaxed)
    }

    pub fn request_hard(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn request_clean(&self) {
        self.clean.store(true, Ordering::Relaxed);
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Called once draining is over; receive loops exit shortly after.
    pub fn stop_receiving(&self) {
        self.receiving.store(false, Ordering::Relaxed);
    }
}

pub async fn watch_signals(shutdown: Arc<Shutdown>) {
    let (mut interrupt, mut terminate, mut hangup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => {
            error!("could not install signal handlers");
            return;
        }
    };

    let mut already_signalled = false;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                if already_signalled {
                    std::process::exit(1);
                }
                already_signalled = true;
                warn!("hard shutdown requested");
                shutdown.request_hard();
            }
            _ = terminate.recv() => {
                if already_signalled {
                    std::process::exit(1);
                }
                already_signalled = true;
                info!("clean shutdown requested");
                shutdown.request_clean();
            }
            _ = hangup.recv() => {
                if already_signalled {
                    std::process::exit(1);
                }
                already_signalled = true;
                info!("clean shutdown requested");
                shutdown.request_clean();
            }
        }
    }
}
