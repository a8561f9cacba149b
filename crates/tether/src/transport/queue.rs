//! Inbound receive queue with a sticky close sentinel.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tether_wire::Data;

use super::Received;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Data>,
    closed: bool,
    close_signals: usize,
}

/// Thread-safe FIFO of decoded inbound messages.
///
/// Buffered messages are still handed out after [`InboundQueue::close`];
/// only once the buffer is empty does [`InboundQueue::receive`] start
/// returning [`Received::Closed`].
#[derive(Debug, Default)]
pub struct InboundQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl InboundQueue {
    /// Creates an open, empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`. Returns `false` when the queue is already closed.
    pub fn push(&self, data: Data) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(data);
        self.ready.notify_one();
        true
    }

    /// Marks the queue closed. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.close_signals = state.close_signals.saturating_add(1);
        self.ready.notify_all();
        true
    }

    /// Waits up to `timeout` for the next message.
    #[must_use]
    pub fn receive(&self, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(data) = state.items.pop_front() {
                return Received::Data(data);
            }
            if state.closed {
                return Received::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Received::Timeout;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops every buffered message.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        dropped
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// How many times the close sentinel was raised. Never exceeds one.
    #[must_use]
    pub fn close_signals(&self) -> usize {
        self.lock().close_signals
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
