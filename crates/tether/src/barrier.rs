//! Start-up barrier over a dynamically sized set of producers.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How a barrier wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every expected arrival happened.
    Complete,
    /// The barrier was aborted before completion.
    Aborted,
    /// The wait timed out.
    TimedOut,
}

#[derive(Debug)]
struct Progress {
    expected: usize,
    arrived: usize,
    aborted: bool,
}

/// Blocks until `expected` arrivals or an abort.
#[derive(Debug)]
pub struct StartupBarrier {
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl StartupBarrier {
    /// Creates a barrier waiting for `expected` arrivals.
    #[must_use]
    pub const fn new(expected: usize) -> Self {
        Self {
            progress: Mutex::new(Progress {
                expected,
                arrived: 0,
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Records one arrival.
    pub fn arrive(&self) {
        let mut progress = self.lock();
        progress.arrived = progress.arrived.saturating_add(1);
        self.changed.notify_all();
    }

    /// Releases every waiter without completing.
    pub fn abort(&self) {
        let mut progress = self.lock();
        progress.aborted = true;
        self.changed.notify_all();
    }

    /// Number of arrivals so far.
    #[must_use]
    pub fn arrived(&self) -> usize {
        self.lock().arrived
    }

    /// Number of expected arrivals.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.lock().expected
    }

    /// Blocks until complete or aborted.
    #[must_use]
    pub fn wait(&self) -> BarrierOutcome {
        self.wait_until(None)
    }

    /// Blocks until complete, aborted or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> BarrierOutcome {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> BarrierOutcome {
        let mut progress = self.lock();
        loop {
            if progress.arrived >= progress.expected {
                return BarrierOutcome::Complete;
            }
            if progress.aborted {
                return BarrierOutcome::Aborted;
            }
            progress = match deadline {
                None => self
                    .changed
                    .wait(progress)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return BarrierOutcome::TimedOut;
                    }
                    self.changed
                        .wait_timeout(progress, limit - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
