//! Capability discovery and the catalogue snapshot.
//!
//! The host answers a tagged `machine-interfaces-request` sent to the
//! `discovery-aggregator` device with a `machine-interfaces` message listing
//! every interface it exposes. [`Discovery`] repeats the request every retry
//! interval until an answer arrives; each answer replaces the
//! [`CapabilityCatalogue`] in its [`CatalogueCell`] wholesale.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use tether_wire::{Address, Command, Data, WireError, fresh_tag, now_seconds};

use crate::capability::{CapabilityDescriptor, InterfaceType};
use crate::device::{CommandSink, Device};
use crate::fanout::{Fanout, Flow, Subscription};
use crate::metrics::MetricsRegistry;
use crate::requester::{Correlation, RequestError, Requester};

const DISCOVERY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::discovery");

/// `deviceType` answering discovery requests.
pub const DISCOVERY_AGGREGATOR: &str = "discovery-aggregator";
/// `dataType` of a discovery request.
pub const MACHINE_INTERFACES_REQUEST: &str = "machine-interfaces-request";
/// `dataType` of a discovery answer.
pub const MACHINE_INTERFACES: &str = "machine-interfaces";

/// Immutable list of the capabilities the host exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityCatalogue {
    as_of: f64,
    capabilities: Vec<CapabilityDescriptor>,
}

impl CapabilityCatalogue {
    /// Wraps an already built list.
    #[must_use]
    pub const fn new(as_of: f64, capabilities: Vec<CapabilityDescriptor>) -> Self {
        Self {
            as_of,
            capabilities,
        }
    }

    /// Builds a catalogue from a discovery answer.
    ///
    /// Unknown interface types are logged and skipped. When two entries share
    /// an address and interface type the first one wins.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MissingField`] when the answer has no interface
    /// list.
    pub fn from_data(data: &Data) -> Result<Self, WireError> {
        let entries = data.machine_interfaces()?;
        let mut seen: HashSet<(Address, InterfaceType)> = HashSet::new();
        let mut capabilities = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some(descriptor) = CapabilityDescriptor::from_entry(entry) else {
                warn!(
                    target: DISCOVERY_TARGET,
                    interface_type = %entry.interface_type,
                    device_type = %entry.device_type,
                    device_name = %entry.device_name,
                    "skipping unknown interface type"
                );
                continue;
            };
            if !seen.insert((descriptor.address.clone(), descriptor.interface)) {
                warn!(
                    target: DISCOVERY_TARGET,
                    capability = %descriptor,
                    "skipping duplicate capability"
                );
                continue;
            }
            capabilities.push(descriptor);
        }
        Ok(Self {
            as_of: data.ts.unwrap_or_else(now_seconds),
            capabilities,
        })
    }

    /// Capture time of the discovery answer.
    #[must_use]
    pub const fn as_of(&self) -> f64 {
        self.as_of
    }

    /// Capabilities in discovery order.
    #[must_use]
    pub fn capabilities(&self) -> &[CapabilityDescriptor] {
        &self.capabilities
    }

    /// Number of capabilities.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns `true` when nothing was discovered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Capabilities that produce a sample stream.
    pub fn streaming(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.capabilities
            .iter()
            .filter(|descriptor| descriptor.is_streaming())
    }

    /// Looks up one capability.
    #[must_use]
    pub fn find(
        &self,
        address: &Address,
        interface: InterfaceType,
    ) -> Option<&CapabilityDescriptor> {
        self.capabilities
            .iter()
            .find(|descriptor| &descriptor.address == address && descriptor.interface == interface)
    }
}

/// Shared slot holding the current catalogue.
///
/// Readers clone an `Arc` out under a read lock; replacement swaps the whole
/// snapshot under the write lock, so a reader sees one catalogue in full.
#[derive(Debug)]
pub struct CatalogueCell {
    current: RwLock<Option<Arc<CapabilityCatalogue>>>,
    updates: Fanout<Arc<CapabilityCatalogue>>,
}

impl Default for CatalogueCell {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogueCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            updates: Fanout::new(),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn current(&self) -> Option<Arc<CapabilityCatalogue>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `catalogue` and notifies subscribers.
    pub fn replace(&self, catalogue: CapabilityCatalogue) -> Arc<CapabilityCatalogue> {
        let snapshot = Arc::new(catalogue);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        self.updates.call(&snapshot);
        snapshot
    }

    /// Registers a subscriber for replacements.
    pub fn add_update_callback<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&Arc<CapabilityCatalogue>) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.updates.add(callback, finished)
    }

    /// Blocks until a catalogue is present, the cell closes or `timeout`
    /// elapses. `None` waits without a deadline.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Arc<CapabilityCatalogue>> {
        let (sender, receiver) = mpsc::channel();
        let found = sender.clone();
        let subscription = self.updates.add(
            move |catalogue| {
                if found.send(Some(Arc::clone(catalogue))).is_err() {
                    trace!(target: DISCOVERY_TARGET, "catalogue after wait ended");
                }
                Flow::StopAndFinish
            },
            move || {
                if sender.send(None).is_err() {
                    trace!(target: DISCOVERY_TARGET, "catalogue wait already ended");
                }
            },
        );
        if let Some(existing) = self.current() {
            subscription.cancel();
            return Some(existing);
        }
        let received = match timeout {
            Some(limit) => receiver.recv_timeout(limit).ok().flatten(),
            None => receiver.recv().ok().flatten(),
        };
        subscription.cancel();
        received.or_else(|| self.current())
    }

    /// Releases every waiter. Idempotent.
    pub fn close(&self) {
        self.updates.close();
    }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.updates.is_closed()
    }
}

/// Requester bound to the discovery aggregator.
#[derive(Debug)]
pub struct Discovery {
    requester: Arc<Requester>,
    cell: Arc<CatalogueCell>,
    retry: Duration,
}

impl Discovery {
    /// Creates the discovery device. Every `machine-interfaces` message it
    /// receives, tagged or not, replaces the catalogue.
    #[must_use]
    pub fn new(sink: Arc<dyn CommandSink>, retry: Duration) -> Self {
        let device = Arc::new(Device::new(Address::singleton(DISCOVERY_AGGREGATOR), sink));
        let cell = Arc::new(CatalogueCell::new());
        let answers = Arc::clone(&cell);
        let closing = Arc::clone(&cell);
        device.add_callback(
            move |data| {
                if data.data_type == MACHINE_INTERFACES {
                    adopt(&answers, data);
                }
                Flow::Continue
            },
            move || closing.close(),
        );
        Self {
            requester: Arc::new(Requester::new(device, retry)),
            cell,
            retry,
        }
    }

    /// Underlying device.
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        self.requester.device()
    }

    /// Catalogue slot fed by this device.
    #[must_use]
    pub const fn catalogue(&self) -> &Arc<CatalogueCell> {
        &self.cell
    }

    /// Requests the catalogue now and every retry interval until one arrives.
    pub fn start(&self, metrics: MetricsRegistry) {
        let requester: Weak<Requester> = Arc::downgrade(&self.requester);
        let cell = Arc::clone(&self.cell);
        let retry = self.retry;
        let mut attempts: u64 = 0;
        self.device().poll(retry, move || {
            if cell.current().is_some() {
                return Flow::StopAndFinish;
            }
            let Some(live) = requester.upgrade() else {
                return Flow::StopAndFinish;
            };
            attempts = attempts.saturating_add(1);
            let request = Command::new(
                Address::singleton(DISCOVERY_AGGREGATOR),
                MACHINE_INTERFACES_REQUEST,
            )
            .with_tag(fresh_tag());
            let sent = live.send_with_correlation(
                request,
                Correlation::with_timeout(retry),
                |_| {},
                || {},
            );
            match sent {
                Ok(_) => {
                    metrics.discovery_attempt();
                    debug!(target: DISCOVERY_TARGET, attempt = attempts, "discovery requested");
                    Flow::Continue
                }
                Err(RequestError::Closed { .. }) => Flow::StopAndFinish,
                Err(error) => {
                    warn!(target: DISCOVERY_TARGET, error = %error, "discovery request failed");
                    Flow::Continue
                }
            }
        });
    }

    /// Blocks until a catalogue arrives or the device closes.
    #[must_use]
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Arc<CapabilityCatalogue>> {
        self.cell.wait(timeout)
    }

    /// Closes the device and releases waiters.
    pub fn close(&self) {
        self.device().close();
        self.cell.close();
    }
}

fn adopt(cell: &CatalogueCell, data: &Data) {
    match CapabilityCatalogue::from_data(data) {
        Ok(catalogue) => {
            info!(
                target: DISCOVERY_TARGET,
                capabilities = catalogue.len(),
                "capability catalogue received"
            );
            cell.replace(catalogue);
        }
        Err(error) => warn!(
            target: DISCOVERY_TARGET,
            error = %error,
            "ignoring malformed discovery answer"
        ),
    }
}
