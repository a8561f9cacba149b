//! Liveness signal shared between a transport handle and its workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic record of the most recent beat.
#[derive(Debug)]
pub struct Heartbeat {
    origin: Instant,
    last_beat_us: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// Creates a heartbeat that has just beaten.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_beat_us: AtomicU64::new(0),
        }
    }

    /// Records a beat now.
    pub fn beat(&self) {
        self.last_beat_us.store(self.elapsed_us(), Ordering::Release);
    }

    /// Time since the last beat.
    #[must_use]
    pub fn age(&self) -> Duration {
        let last = self.last_beat_us.load(Ordering::Acquire);
        Duration::from_micros(self.elapsed_us().saturating_sub(last))
    }

    /// Returns `true` when the last beat is older than `timeout`.
    #[must_use]
    pub fn is_lost(&self, timeout: Duration) -> bool {
        self.age() > timeout
    }

    fn elapsed_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}
