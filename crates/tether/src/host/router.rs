//! Address-keyed routing table.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tether_wire::{Address, Data};

use crate::device::Device;

/// Maps each address to the devices listening on it.
///
/// Routing clones the device list out of the read lock before delivering,
/// so subscriber callbacks may register further devices.
#[derive(Debug, Default)]
pub(crate) struct Router {
    routes: RwLock<HashMap<Address, Vec<Arc<Device>>>>,
}

impl Router {
    pub(crate) fn register(&self, device: Arc<Device>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.address().clone())
            .or_default()
            .push(device);
    }

    /// Delivers `data` to every open device on its address, returning how
    /// many received it.
    pub(crate) fn route(&self, data: &Data) -> usize {
        let targets = self.devices(&data.address);
        let mut delivered: usize = 0;
        for device in targets.iter().filter(|device| !device.is_closed()) {
            device.deliver(data);
            delivered = delivered.saturating_add(1);
        }
        delivered
    }

    pub(crate) fn devices(&self, address: &Address) -> Vec<Arc<Device>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn close_all(&self) {
        let devices: Vec<Arc<Device>> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect();
        for device in devices {
            device.close();
        }
    }
}
