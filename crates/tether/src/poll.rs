//! Timed background actions owned by a device.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::fanout::Flow;

const POLL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::poll");

/// Cancellation flag that sleeping threads can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal and wakes every waiter.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }

    /// Returns `true` once [`StopSignal::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`, returning `true` if the signal was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

type TimerAction = Box<dyn FnOnce() + Send>;
type TimerKey = (Instant, u64);

#[derive(Default)]
struct TimerQueue {
    pending: BTreeMap<TimerKey, TimerAction>,
    next_id: u64,
    stopped: bool,
    worker: bool,
}

/// Deadline queue served by a single worker thread.
#[derive(Default)]
struct Timers {
    queue: Mutex<TimerQueue>,
    wake: Condvar,
}

impl fmt::Debug for Timers {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.lock();
        formatter
            .debug_struct("Timers")
            .field("pending", &queue.pending.len())
            .field("stopped", &queue.stopped)
            .finish()
    }
}

impl Timers {
    fn lock(&self) -> MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, key: TimerKey) -> bool {
        let removed = self.lock().pending.remove(&key);
        self.wake.notify_all();
        removed.is_some()
    }

    fn stop(&self) {
        let dropped = {
            let mut queue = self.lock();
            queue.stopped = true;
            std::mem::take(&mut queue.pending)
        };
        self.wake.notify_all();
        drop(dropped);
    }

    fn run(&self) {
        let mut queue = self.lock();
        while !queue.stopped {
            let now = Instant::now();
            let next = queue.pending.first_key_value().map(|(key, _)| *key);
            queue = match next {
                Some(key) if key.0 <= now => {
                    let action = queue.pending.remove(&key);
                    drop(queue);
                    if let Some(fire) = action {
                        fire();
                    }
                    self.lock()
                }
                Some((deadline, _)) => {
                    self.wake
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(queue).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// Handle to one action queued with [`PollSet::schedule`].
///
/// Dropping the handle leaves the action queued.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    timers: Weak<Timers>,
    key: Option<TimerKey>,
}

impl TimerHandle {
    /// A handle that refers to nothing.
    #[must_use]
    pub const fn inert() -> Self {
        Self {
            timers: Weak::new(),
            key: None,
        }
    }

    /// Removes the action if it has not run yet, releasing everything it
    /// captured. Returns `true` when something was removed.
    pub fn cancel(&self) -> bool {
        match (self.timers.upgrade(), self.key) {
            (Some(timers), Some(key)) => timers.cancel(key),
            _ => false,
        }
    }
}

/// Set of periodic actions sharing one stop signal.
///
/// Each periodic action runs on its own named thread: it is invoked, then
/// the thread sleeps for whatever remains of the period. An action ends
/// itself by returning [`Flow::StopAndFinish`]; [`PollSet::stop`] ends them
/// all. One-shot actions share a single timer thread per set.
#[derive(Debug)]
pub struct PollSet {
    name: String,
    signal: Arc<StopSignal>,
    timers: Arc<Timers>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PollSet {
    /// Creates an empty set whose threads are named after `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signal: Arc::new(StopSignal::new()),
            timers: Arc::new(Timers::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts `action` with the given `period`.
    ///
    /// Does nothing once the set has been stopped.
    pub fn spawn<F>(&self, period: Duration, mut action: F)
    where
        F: FnMut() -> Flow + Send + 'static,
    {
        if self.signal.is_stopped() {
            return;
        }
        let signal = Arc::clone(&self.signal);
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("poll:{name}"))
            .spawn(move || {
                while !signal.is_stopped() {
                    let started = Instant::now();
                    if action() == Flow::StopAndFinish {
                        debug!(target: POLL_TARGET, poll = %name, "poll finished itself");
                        break;
                    }
                    let remaining = period.saturating_sub(started.elapsed());
                    if signal.wait(remaining) {
                        break;
                    }
                }
            });
        self.track(spawned);
    }

    /// Runs `action` once after `delay` on the set's timer thread, unless
    /// the set is stopped or the returned handle is cancelled first.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            return TimerHandle::inert();
        };
        let (key, start_worker) = {
            let mut queue = self.timers.lock();
            if queue.stopped || self.signal.is_stopped() {
                return TimerHandle::inert();
            }
            let key = (deadline, queue.next_id);
            queue.next_id = queue.next_id.wrapping_add(1);
            queue.pending.insert(key, Box::new(action));
            let start_worker = !queue.worker;
            queue.worker = true;
            (key, start_worker)
        };
        self.timers.wake.notify_all();
        if start_worker {
            self.start_timer_worker();
        }
        TimerHandle {
            timers: Arc::downgrade(&self.timers),
            key: Some(key),
        }
    }

    fn start_timer_worker(&self) {
        let timers = Arc::clone(&self.timers);
        let spawned = thread::Builder::new()
            .name(format!("timer:{}", self.name))
            .spawn(move || timers.run());
        if spawned.is_err() {
            self.timers.lock().worker = false;
        }
        self.track(spawned);
    }

    fn track(&self, spawned: std::io::Result<JoinHandle<()>>) {
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
                handles.retain(|existing| !existing.is_finished());
                handles.push(handle);
            }
            Err(error) => warn!(
                target: POLL_TARGET,
                poll = %self.name,
                error = %error,
                "failed to spawn poll thread"
            ),
        }
    }

    /// Stops every action and joins their threads.
    ///
    /// Safe to call from inside an action: the calling thread is not joined.
    pub fn stop(&self) {
        self.signal.stop();
        self.timers.stop();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current: ThreadId = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(target: POLL_TARGET, poll = %self.name, "poll thread panicked");
            }
        }
    }

    /// Returns `true` once the set has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Number of one-shot actions still waiting for their deadline.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().pending.len()
    }
}

impl Drop for PollSet {
    fn drop(&mut self) {
        self.signal.stop();
        self.timers.stop();
    }
}
