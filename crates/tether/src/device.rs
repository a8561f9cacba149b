//! Addressed consumer/producer unit.
//!
//! A [`Device`] receives every inbound [`Data`] the host routes to its
//! address, remembers the latest sample of each `dataType`, and rebroadcasts
//! the sample through its [`Fanout`]. Outbound commands go through a
//! [`CommandSink`], which the host backs with the transport.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use tether_wire::{Address, Command, Data};

use crate::fanout::{Fanout, Flow, Subscription};
use crate::poll::{PollSet, TimerHandle};

pub(crate) const DEVICE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::device");

/// Destination for outbound commands.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink: Send + Sync {
    /// Queues `command` for delivery. Must not block on the network.
    fn send(&self, command: Command);
}

impl<T> CommandSink for Arc<T>
where
    T: CommandSink + ?Sized,
{
    fn send(&self, command: Command) {
        (**self).send(command);
    }
}

/// One addressed unit of the remote host.
pub struct Device {
    address: Address,
    sink: Arc<dyn CommandSink>,
    fanout: Fanout<Data>,
    latest: Mutex<HashMap<String, Data>>,
    polls: PollSet,
    closed: AtomicBool,
}

impl fmt::Debug for Device {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Device")
            .field("address", &self.address)
            .field("subscribers", &self.fanout.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Creates an open device bound to `address`.
    #[must_use]
    pub fn new(address: Address, sink: Arc<dyn CommandSink>) -> Self {
        let polls = PollSet::new(address.to_string());
        Self {
            address,
            sink,
            fanout: Fanout::new(),
            latest: Mutex::new(HashMap::new()),
            polls,
            closed: AtomicBool::new(false),
        }
    }

    /// Address this device answers to.
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Returns `true` when `data` is addressed to this device.
    #[must_use]
    pub fn accepts(&self, data: &Data) -> bool {
        data.address == self.address
    }

    /// Caches `data` and broadcasts it to subscribers.
    pub fn deliver(&self, data: &Data) {
        if self.is_closed() {
            return;
        }
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(data.data_type.clone(), data.clone());
        trace!(
            target: DEVICE_TARGET,
            address = %self.address,
            data_type = %data.data_type,
            "delivering data"
        );
        self.fanout.call(data);
    }

    /// Latest cached sample of `data_type`.
    #[must_use]
    pub fn latest(&self, data_type: &str) -> Option<Data> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_type)
            .cloned()
    }

    /// Registers a subscriber with a finished signal.
    pub fn add_callback<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&Data) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.fanout.add(callback, finished)
    }

    /// Registers a subscriber that receives every sample until cancelled.
    pub fn subscribe<C>(&self, mut callback: C) -> Subscription
    where
        C: FnMut(&Data) + Send + 'static,
    {
        self.fanout.add_callback(move |data| {
            callback(data);
            Flow::Continue
        })
    }

    /// Stamps `command` and hands it to the sink. Dropped once closed.
    pub fn send(&self, mut command: Command) {
        if self.is_closed() {
            debug!(
                target: DEVICE_TARGET,
                address = %self.address,
                data_type = %command.data_type,
                "dropping command for closed device"
            );
            return;
        }
        command.stamp();
        self.sink.send(command);
    }

    /// Starts a periodic action owned by this device.
    pub fn poll<F>(&self, period: Duration, action: F)
    where
        F: FnMut() -> Flow + Send + 'static,
    {
        self.polls.spawn(period, action);
    }

    /// Runs `action` once after `delay` unless the device closes or the
    /// returned handle is cancelled first.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.polls.schedule(delay, action)
    }

    /// Number of scheduled actions that have not fired or been cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.polls.pending_timers()
    }

    /// Stops polls and finishes every subscriber. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: DEVICE_TARGET, address = %self.address, "closing device");
        self.polls.stop();
        self.fanout.close();
    }

    /// Returns `true` once [`Device::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
