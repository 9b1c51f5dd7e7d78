// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Link bookkeeping shared by both ends.

use super::ChannelStatus;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds, for heartbeat timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Exponential reconnect delay, doubling up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self { initial, max: max.max(initial), current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Tracks when the peer was last heard from.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_seen: Instant,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self { last_seen: Instant::now(), timeout }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Silent for `timeout` is Degraded, for twice that Disconnected.
    pub fn status_at(&self, now: Instant) -> ChannelStatus {
        let silent = now.saturating_duration_since(self.last_seen);
        if silent >= self.timeout * 2 {
            ChannelStatus::Disconnected
        } else if silent >= self.timeout {
            ChannelStatus::Degraded
        } else {
            ChannelStatus::Connected
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status_at(Instant::now())
    }
}
