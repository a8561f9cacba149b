//! Engine metrics owned by one host.
//!
//! Counters are plain atomics updated with `Relaxed` ordering: they are
//! independent measurements and nothing synchronises on them. A registry is
//! created by the caller, handed to the host, and sealed when the host
//! closes; records made after sealing are ignored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Accumulated samples of one named timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerStats {
    /// Number of samples.
    pub count: u64,
    /// Sum of all samples in microseconds.
    pub total_us: u64,
    /// Largest sample in microseconds.
    pub max_us: u64,
}

impl TimerStats {
    fn record(&mut self, micros: u64) {
        self.count = self.count.saturating_add(1);
        self.total_us = self.total_us.saturating_add(micros);
        self.max_us = self.max_us.max(micros);
    }
}

/// Point-in-time copy of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Time since the registry was created, in milliseconds.
    pub uptime_ms: u64,
    /// Inbound messages decoded.
    pub data_received: u64,
    /// Inbound messages no device accepted.
    pub data_unrouted: u64,
    /// Outbound commands queued.
    pub commands_sent: u64,
    /// Discovery requests issued.
    pub discovery_attempts: u64,
    /// Total time spent dispatching inbound data, in microseconds.
    pub dispatch_time_us: u64,
    /// Named timers.
    pub timers: BTreeMap<String, TimerStats>,
    /// Whether the owning host has closed.
    pub sealed: bool,
}

#[derive(Debug)]
struct Inner {
    started: Instant,
    sealed: AtomicBool,
    data_received: AtomicU64,
    data_unrouted: AtomicU64,
    commands_sent: AtomicU64,
    discovery_attempts: AtomicU64,
    dispatch_time_us: AtomicU64,
    timers: Mutex<BTreeMap<String, TimerStats>>,
}

/// Cheap-clone handle over shared counters.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Instant::now(),
                sealed: AtomicBool::new(false),
                data_received: AtomicU64::new(0),
                data_unrouted: AtomicU64::new(0),
                commands_sent: AtomicU64::new(0),
                discovery_attempts: AtomicU64::new(0),
                dispatch_time_us: AtomicU64::new(0),
                timers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn bump(&self, counter: &AtomicU64, amount: u64) {
        if self.is_sealed() {
            return;
        }
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Records one decoded inbound message.
    pub fn data_received(&self) {
        self.bump(&self.inner.data_received, 1);
    }

    /// Records one inbound message that no device accepted.
    pub fn data_unrouted(&self) {
        self.bump(&self.inner.data_unrouted, 1);
    }

    /// Records one queued outbound command.
    pub fn command_sent(&self) {
        self.bump(&self.inner.commands_sent, 1);
    }

    /// Records one discovery request.
    pub fn discovery_attempt(&self) {
        self.bump(&self.inner.discovery_attempts, 1);
    }

    /// Adds to the total dispatch time.
    pub fn dispatch_time(&self, elapsed: Duration) {
        self.bump(&self.inner.dispatch_time_us, micros(elapsed));
    }

    /// Starts a named timer, recorded when the guard drops.
    #[must_use = "the timer records when the guard is dropped"]
    pub fn time(&self, name: &'static str) -> TimerGuard {
        TimerGuard {
            registry: self.clone(),
            name,
            started: Instant::now(),
        }
    }

    /// Adds one sample to the named timer.
    pub fn record(&self, name: &str, elapsed: Duration) {
        if self.is_sealed() {
            return;
        }
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .record(micros(elapsed));
    }

    /// Stops accepting records.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_ms: u64::try_from(self.inner.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            data_received: self.inner.data_received.load(Ordering::Relaxed),
            data_unrouted: self.inner.data_unrouted.load(Ordering::Relaxed),
            commands_sent: self.inner.commands_sent.load(Ordering::Relaxed),
            discovery_attempts: self.inner.discovery_attempts.load(Ordering::Relaxed),
            dispatch_time_us: self.inner.dispatch_time_us.load(Ordering::Relaxed),
            timers: self
                .inner
                .timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            sealed: self.is_sealed(),
        }
    }
}

/// Records the elapsed time into its registry when dropped.
#[derive(Debug)]
pub struct TimerGuard {
    registry: MetricsRegistry,
    name: &'static str,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.registry.record(self.name, self.started.elapsed());
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}
