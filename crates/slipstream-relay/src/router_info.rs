//! Backend-synchronized wall clock.
//!
//! Token and session expiry are judged against the backend's clock, not the
//! host's: the current time is the last backend-supplied timestamp plus the
//! monotonic seconds elapsed since that update arrived.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
pub struct RouterInfo {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    backend_timestamp: u64,
    synced: Instant,
}

impl Default for RouterInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterInfo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend_timestamp: 0,
                synced: Instant::now(),
            }),
        }
    }

    /// Record a fresh backend timestamp (seconds) and reset the monotonic
    /// origin.
    pub fn set_timestamp(&self, timestamp: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.backend_timestamp = timestamp;
        inner.synced = Instant::now();
    }

    /// Backend wall-clock seconds, extrapolated monotonically.
    pub fn current_time(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.backend_timestamp + inner.synced.elapsed().as_secs()
    }
}
