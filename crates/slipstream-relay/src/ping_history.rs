//! Relay ping history and route-quality statistics.
//!
//! Each peer relay owns a 64-slot ring of outgoing pings. A pong is matched
//! to its slot by sequence; if the slot has since been overwritten the
//! sample is discarded. Stats are derived over a trailing window, excluding
//! a safety tail so in-flight pongs are not counted as losses.

/// Slots in the ring. Enough for one stats window plus slack at the
/// one-ping-per-second cadence.
pub const PING_HISTORY_ENTRIES: usize = 64;

const NO_TIME: f64 = -1.0;

#[derive(Debug, Clone, Copy)]
struct Entry {
    sequence: u64,
    time_ping_sent: f64,
    time_pong_received: f64,
}

const EMPTY_ENTRY: Entry = Entry {
    sequence: u64::MAX,
    time_ping_sent: NO_TIME,
    time_pong_received: NO_TIME,
};

#[derive(Debug, Clone)]
pub struct PingHistory {
    sequence: u64,
    entries: [Entry; PING_HISTORY_ENTRIES],
}

impl Default for PingHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PingHistory {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            entries: [EMPTY_ENTRY; PING_HISTORY_ENTRIES],
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Allocate the next outgoing sequence and stamp its send time.
    pub fn ping_sent(&mut self, time: f64) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;

        let entry = &mut self.entries[(sequence % PING_HISTORY_ENTRIES as u64) as usize];
        entry.sequence = sequence;
        entry.time_ping_sent = time;
        entry.time_pong_received = NO_TIME;

        sequence
    }

    /// Stamp the receive time for a pong, unless its slot was overwritten.
    pub fn pong_received(&mut self, sequence: u64, time: f64) {
        let entry = &mut self.entries[(sequence % PING_HISTORY_ENTRIES as u64) as usize];
        if entry.sequence == sequence {
            entry.time_pong_received = time;
        }
    }
}

/// RTT/jitter/loss derived from a [`PingHistory`] window. Inputs are
/// monotonic seconds; outputs are milliseconds (loss is a percentage).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteStats {
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

impl RouteStats {
    pub fn from_history(history: &PingHistory, start: f64, end: f64, ping_safety: f64) -> Self {
        let start = start.max(0.0);

        // packet loss over [start, end - safety]
        let mut pings_sent = 0u32;
        let mut pongs_received = 0u32;
        for entry in &history.entries {
            if entry.time_ping_sent >= start && entry.time_ping_sent <= end - ping_safety {
                pings_sent += 1;
                if entry.time_pong_received >= entry.time_ping_sent {
                    pongs_received += 1;
                }
            }
        }

        let packet_loss = if pings_sent > 0 {
            (100.0 * (1.0 - f64::from(pongs_received) / f64::from(pings_sent))) as f32
        } else {
            100.0
        };

        // minimum RTT over the full window
        let mut min_rtt = f64::MAX;
        for entry in &history.entries {
            if entry.time_ping_sent >= start
                && entry.time_ping_sent <= end
                && entry.time_pong_received > entry.time_ping_sent
            {
                min_rtt = min_rtt.min(entry.time_pong_received - entry.time_ping_sent);
            }
        }

        if min_rtt == f64::MAX {
            return Self {
                rtt: 0.0,
                jitter: 0.0,
                packet_loss,
            };
        }

        // jitter: mean deviation from the minimum RTT
        let mut jitter_sum = 0.0;
        let mut jitter_samples = 0u32;
        for entry in &history.entries {
            if entry.time_ping_sent >= start
                && entry.time_ping_sent <= end
                && entry.time_pong_received > entry.time_ping_sent
            {
                jitter_sum += (entry.time_pong_received - entry.time_ping_sent) - min_rtt;
                jitter_samples += 1;
            }
        }

        let jitter = if jitter_samples > 0 {
            (1000.0 * jitter_sum / f64::from(jitter_samples)) as f32
        } else {
            0.0
        };

        Self {
            rtt: (1000.0 * min_rtt) as f32,
            jitter,
            packet_loss,
        }
    }
}
