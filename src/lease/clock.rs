//! Wall-clock source for tag timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of tag timestamps, in microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Process-local wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        // a clock before the epoch reads as zero, which only ever makes a
        // tag look older (so renew fails safe)
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as u64)
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
