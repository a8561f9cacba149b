//! Cache of small named values read through the key-value protocol.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use tether_wire::{Command, KEY_VALUE, KEY_VALUE_REQUEST, fresh_tag};

use crate::device::{DEVICE_TARGET, Device};
use crate::fanout::{Fanout, Flow, Subscription};

#[derive(Debug, Default)]
struct Values {
    entries: HashMap<String, String>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    values: Mutex<Values>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Values> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key-value reader bound to one device.
///
/// Requests every configured key with a tagged `key-value-request` and
/// repeats the request for keys that stay unanswered.
#[derive(Debug)]
pub struct KeyValueDevice {
    device: Arc<Device>,
    keys: BTreeSet<String>,
    shared: Arc<Shared>,
    updates: Fanout<(String, String)>,
    retry: Duration,
}

impl KeyValueDevice {
    /// Creates a reader for `keys` on `device`.
    #[must_use]
    pub fn new<I>(device: Arc<Device>, keys: I, retry: Duration) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let shared = Arc::new(Shared::default());
        let updates = Fanout::new();
        let on_data = Arc::clone(&shared);
        let on_close = Arc::clone(&shared);
        let publish = updates.clone();
        let close_updates = updates.clone();
        device.add_callback(
            move |data| {
                if data.data_type != KEY_VALUE {
                    return Flow::Continue;
                }
                if let Some((key, value)) = data.key_value() {
                    on_data
                        .lock()
                        .entries
                        .insert(key.to_owned(), value.to_owned());
                    on_data.changed.notify_all();
                    publish.call(&(key.to_owned(), value.to_owned()));
                }
                Flow::Continue
            },
            move || {
                on_close.lock().closed = true;
                on_close.changed.notify_all();
                close_updates.close();
            },
        );
        Self {
            device,
            keys: keys.into_iter().collect(),
            shared,
            updates,
            retry,
        }
    }

    /// Underlying device.
    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Keys this reader requests.
    #[must_use]
    pub const fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    /// Starts requesting keys until every one has an answer.
    pub fn start(&self) {
        if self.keys.is_empty() {
            return;
        }
        let keys = self.keys.clone();
        let shared = Arc::clone(&self.shared);
        let device: Weak<Device> = Arc::downgrade(&self.device);
        self.device.poll(self.retry, move || {
            let Some(live) = device.upgrade() else {
                return Flow::StopAndFinish;
            };
            let missing: Vec<String> = {
                let values = shared.lock();
                keys.iter()
                    .filter(|key| !values.entries.contains_key(*key))
                    .cloned()
                    .collect()
            };
            if missing.is_empty() {
                return Flow::StopAndFinish;
            }
            for key in missing {
                debug!(
                    target: DEVICE_TARGET,
                    address = %live.address(),
                    key = %key,
                    "requesting key"
                );
                live.send(
                    Command::new(live.address().clone(), KEY_VALUE_REQUEST)
                        .with_key(key)
                        .with_tag(fresh_tag()),
                );
            }
            Flow::Continue
        });
    }

    /// Cached value of `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.shared.lock().entries.get(key).cloned()
    }

    /// Waits up to `timeout` for `key` to have a value.
    #[must_use]
    pub fn wait_for_value(&self, key: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut values = self.shared.lock();
        loop {
            if let Some(value) = values.entries.get(key) {
                return Some(value.clone());
            }
            let now = Instant::now();
            if values.closed || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(values, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            values = guard;
        }
    }

    /// Registers a subscriber for `(key, value)` updates.
    pub fn add_update_callback<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&(String, String)) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.updates.add(callback, finished)
    }

    /// Closes the device and finishes every update subscriber.
    pub fn close(&self) {
        self.device.close();
        self.updates.close();
    }
}
