//! Thread-safe multi-subscriber broadcaster.
//!
//! Every subscriber registered on a [`Fanout`] receives exactly one terminal
//! signal through its finished callback: either because it asked to stop
//! (returned [`Flow::StopAndFinish`] or cancelled its [`Subscription`]) or
//! because the fan-out was closed while it was still registered. Removal from
//! the subscriber list is the single point that hands out the finished
//! callback, so the two causes can race without double-firing.
//!
//! A callback runs with its slot emptied. A delivery made from inside a
//! callback therefore skips the subscriber that is already running on that
//! thread instead of blocking on it; other threads wait for it to return.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

/// Decision returned by a subscriber after each delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep receiving items.
    Continue,
    /// Unsubscribe now and fire the finished callback once.
    StopAndFinish,
}

type Callback<T> = Box<dyn FnMut(&T) -> Flow + Send>;
type Finished = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    callback: Option<Callback<T>>,
    running_on: Option<ThreadId>,
}

/// Holds one subscriber's callback between deliveries.
struct CallbackCell<T> {
    slot: Mutex<Slot<T>>,
    returned: Condvar,
}

impl<T> CallbackCell<T> {
    const fn new(callback: Callback<T>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                callback: Some(callback),
                running_on: None,
            }),
            returned: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the callback out for one delivery, or `None` when the calling
    /// thread is already inside it.
    fn checkout(&self) -> Option<Running<'_, T>> {
        let current = thread::current().id();
        let mut slot = self.lock();
        loop {
            if slot.running_on == Some(current) {
                return None;
            }
            if let Some(callback) = slot.callback.take() {
                slot.running_on = Some(current);
                return Some(Running {
                    cell: self,
                    callback: Some(callback),
                });
            }
            slot = self
                .returned
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A checked-out callback; puts itself back when dropped, even on unwind.
struct Running<'a, T> {
    cell: &'a CallbackCell<T>,
    callback: Option<Callback<T>>,
}

impl<T> Running<'_, T> {
    fn deliver(&mut self, item: &T) -> Flow {
        self.callback
            .as_mut()
            .map_or(Flow::Continue, |callback| callback(item))
    }
}

impl<T> Drop for Running<'_, T> {
    fn drop(&mut self) {
        let mut slot = self.cell.lock();
        slot.callback = self.callback.take();
        slot.running_on = None;
        self.cell.returned.notify_all();
    }
}

struct Entry<T> {
    id: u64,
    callback: Arc<CallbackCell<T>>,
    finished: Option<Finished>,
}

struct State<T> {
    entries: Vec<Entry<T>>,
    closed: bool,
    next_id: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a subscriber, returning its finished callback slot if it was
    /// still registered.
    fn remove(&self, id: u64) -> Option<Option<Finished>> {
        let mut state = self.lock();
        let position = state.entries.iter().position(|entry| entry.id == id)?;
        let entry = state.entries.remove(position);
        Some(entry.finished)
    }

    fn is_registered(&self, id: u64) -> bool {
        self.lock().entries.iter().any(|entry| entry.id == id)
    }
}

/// Broadcasts items to registered callbacks.
pub struct Fanout<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: Vec::new(),
                    closed: false,
                    next_id: 0,
                }),
            }),
        }
    }
}

impl<T> fmt::Debug for Fanout<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        formatter
            .debug_struct("Fanout")
            .field("subscribers", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: 'static> Fanout<T> {
    /// Creates an open fan-out with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` and the `finished` signal that ends it.
    ///
    /// Registering on a closed fan-out fires `finished` immediately and
    /// returns an inert subscription.
    pub fn add<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&T) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.register(Box::new(callback), Some(Box::new(finished)))
    }

    /// Registers a callback that has no finished signal.
    pub fn add_callback<C>(&self, callback: C) -> Subscription
    where
        C: FnMut(&T) -> Flow + Send + 'static,
    {
        self.register(Box::new(callback), None)
    }

    fn register(&self, callback: Callback<T>, finished: Option<Finished>) -> Subscription {
        let mut state = self.shared.lock();
        if state.closed {
            drop(state);
            // The fan-out is gone: the only remaining signal is "finished".
            if let Some(on_finished) = finished {
                on_finished();
            }
            return Subscription::inert();
        }
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        state.entries.push(Entry {
            id,
            callback: Arc::new(CallbackCell::new(callback)),
            finished,
        });
        drop(state);
        Subscription::new(Arc::downgrade(&self.shared), id)
    }

    /// Delivers `item` to every subscriber registered when the call starts.
    ///
    /// Subscribers removed while the delivery is in progress are skipped, as
    /// is a subscriber whose callback is making this call.
    pub fn call(&self, item: &T) {
        let snapshot: Vec<(u64, Arc<CallbackCell<T>>)> = {
            let state = self.shared.lock();
            if state.closed {
                return;
            }
            state
                .entries
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                .collect()
        };

        for (id, callback) in snapshot {
            if !self.shared.is_registered(id) {
                continue;
            }
            let Some(mut running) = callback.checkout() else {
                continue;
            };
            let flow = running.deliver(item);
            drop(running);
            if flow == Flow::StopAndFinish
                && let Some(Some(finished)) = self.shared.remove(id)
            {
                finished();
            }
        }
    }

    /// Closes the fan-out, firing the finished callback of every remaining
    /// subscriber. Idempotent.
    pub fn close(&self) {
        let entries = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.entries)
        };
        for finished in entries.into_iter().filter_map(|entry| entry.finished) {
            finished();
        }
    }

    /// Returns `true` once [`Fanout::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Returns `true` when nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle that unregisters one subscriber.
///
/// Dropping the handle leaves the subscriber registered. Cancelling is
/// idempotent and safe from inside the subscriber's own callback.
#[derive(Clone)]
pub struct Subscription {
    cancel: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Subscription {
    fn new<T: 'static>(shared: Weak<Shared<T>>, id: u64) -> Self
    where
        Shared<T>: Send + Sync,
    {
        let cancel = move || {
            let Some(live) = shared.upgrade() else {
                return;
            };
            if let Some(Some(finished)) = live.remove(id) {
                finished();
            }
        };
        Self {
            cancel: Some(Arc::new(cancel)),
        }
    }

    /// A subscription that refers to nothing.
    #[must_use]
    pub const fn inert() -> Self {
        Self { cancel: None }
    }

    /// Unregisters the subscriber and fires its finished callback if no
    /// terminal signal has fired yet.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("inert", &self.cancel.is_none())
            .finish()
    }
}
