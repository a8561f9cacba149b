//! Discovered capabilities and the devices built for them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use strum::{Display, EnumString};
use tether_wire::{Address, MachineInterfaceEntry};

use crate::device::{CommandSink, Device};
use crate::keyvalue::KeyValueDevice;
use crate::requester::{RequestError, Requester};

/// Kind of interaction a machine interface offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum InterfaceType {
    /// Mute audio output.
    AudioRequestMute,
    /// Unmute audio output.
    AudioRequestUnmute,
    /// Client-side annotation upload.
    ClientAnnotation,
    /// Connected-clients query.
    ConnectedClientsRequest,
    /// Disable experiment flags.
    DisableExperiments,
    /// Enable experiment flags.
    EnableExperiments,
    /// Event reporting.
    Event,
    /// Sample produced on explicit request.
    FrameRequest,
    /// Historic data query.
    HistoryRequest,
    /// Model inference request.
    InferenceRequest,
    /// Key-value answers.
    KeyValue,
    /// Key-value reads.
    KeyValueRequest,
    /// Capability discovery.
    MachineInterfacesRequest,
    /// Liveness check.
    Ping,
    /// Pipeline description query.
    PipelineDescriptionRequest,
    /// Pointer input.
    PointerEvent,
    /// Samples pushed without a request.
    Publish,
    /// Scripted command stream.
    ReachScript,
    /// Named script execution.
    RunScript,
    /// Stream start/stop request.
    StreamRequest,
    /// Text instruction query.
    TextInstructionRequest,
    /// Operator labelling.
    UserLabel,
    /// Raw controller command.
    UrCommand,
}

impl InterfaceType {
    /// Returns `true` for interfaces that produce a sample stream.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Publish | Self::FrameRequest)
    }

    /// Returns `true` for key-value interfaces.
    #[must_use]
    pub const fn is_key_value(self) -> bool {
        matches!(self, Self::KeyValue | Self::KeyValueRequest)
    }

    /// How samples of this interface reach the client.
    #[must_use]
    pub const fn delivery_strategy(self) -> DeliveryStrategy {
        match self {
            Self::Publish => DeliveryStrategy::Push,
            _ => DeliveryStrategy::PollOnRequest,
        }
    }
}

/// Whether a device must poll to receive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeliveryStrategy {
    /// The host sends samples unsolicited.
    Push,
    /// The client must issue periodic requests.
    PollOnRequest,
}

/// One producible or consumable stream exposed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    /// Device address.
    pub address: Address,
    /// Interaction kind.
    pub interface: InterfaceType,
    /// `dataType` of the samples or commands.
    pub data_kind: String,
    /// Delivery strategy derived from the interface.
    pub strategy: DeliveryStrategy,
    /// Named keys, for key-value interfaces.
    pub keys: BTreeSet<String>,
}

impl CapabilityDescriptor {
    /// Builds a descriptor, deriving the delivery strategy.
    #[must_use]
    pub fn new(address: Address, interface: InterfaceType, data_kind: impl Into<String>) -> Self {
        Self {
            address,
            interface,
            data_kind: data_kind.into(),
            strategy: interface.delivery_strategy(),
            keys: BTreeSet::new(),
        }
    }

    /// Adds key names.
    #[must_use]
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Parses a discovery entry; `None` when the interface type is unknown.
    #[must_use]
    pub fn from_entry(entry: &MachineInterfaceEntry) -> Option<Self> {
        let interface = entry.interface_type.parse::<InterfaceType>().ok()?;
        Some(
            Self::new(
                Address::new(entry.device_type.clone(), entry.device_name.clone()),
                interface,
                entry.data_type.clone(),
            )
            .with_keys(entry.keys.iter().cloned()),
        )
    }

    /// Returns `true` when the capability produces a sample stream.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.interface.is_streaming()
    }
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}/{}/{} ({})",
            self.address, self.interface, self.data_kind, self.strategy
        )
    }
}

/// A device constructed for one discovered capability.
#[derive(Debug)]
pub enum Capability {
    /// Sample stream, pushed or polled.
    Stream {
        /// Source descriptor.
        descriptor: CapabilityDescriptor,
        /// Correlating device front end.
        requester: Arc<Requester>,
    },
    /// Named configuration values.
    KeyValue {
        /// Source descriptor.
        descriptor: CapabilityDescriptor,
        /// Key-value cache.
        store: Arc<KeyValueDevice>,
    },
    /// Command-only interface.
    Request {
        /// Source descriptor.
        descriptor: CapabilityDescriptor,
        /// Correlating device front end.
        requester: Arc<Requester>,
    },
}

/// Timing knobs the capability devices need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityTimings {
    /// Untagged resend period for one-off sample requests.
    pub untagged_resend: Duration,
    /// Re-request period for unanswered keys.
    pub key_value_retry: Duration,
}

impl Capability {
    /// Builds the device variant selected by the descriptor's interface.
    #[must_use]
    pub fn build(
        descriptor: CapabilityDescriptor,
        sink: Arc<dyn CommandSink>,
        timings: CapabilityTimings,
    ) -> Self {
        let device = Arc::new(Device::new(descriptor.address.clone(), sink));
        if descriptor.interface.is_key_value() {
            let store = Arc::new(KeyValueDevice::new(
                device,
                descriptor.keys.iter().cloned(),
                timings.key_value_retry,
            ));
            return Self::KeyValue { descriptor, store };
        }
        let requester = Arc::new(Requester::new(device, timings.untagged_resend));
        if descriptor.is_streaming() {
            Self::Stream {
                descriptor,
                requester,
            }
        } else {
            Self::Request {
                descriptor,
                requester,
            }
        }
    }

    /// Source descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &CapabilityDescriptor {
        match self {
            Self::Stream { descriptor, .. }
            | Self::KeyValue { descriptor, .. }
            | Self::Request { descriptor, .. } => descriptor,
        }
    }

    /// Device receiving this capability's data.
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        match self {
            Self::Stream { requester, .. } | Self::Request { requester, .. } => {
                requester.device()
            }
            Self::KeyValue { store, .. } => store.device(),
        }
    }

    /// Correlating front end, for stream and request capabilities.
    #[must_use]
    pub const fn requester(&self) -> Option<&Arc<Requester>> {
        match self {
            Self::Stream { requester, .. } | Self::Request { requester, .. } => Some(requester),
            Self::KeyValue { .. } => None,
        }
    }

    /// Returns `true` when the capability produces a sample stream.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }

    /// Starts background activity: untagged polling for poll-on-request
    /// streams, key requests for key-value stores.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPeriod`] for a zero poll period.
    pub fn start(&self, stream_poll: Duration) -> Result<(), RequestError> {
        match self {
            Self::Stream {
                descriptor,
                requester,
            } if descriptor.strategy == DeliveryStrategy::PollOnRequest => {
                requester.set_untagged_request_period(Some(stream_poll))
            }
            Self::KeyValue { store, .. } => {
                store.start();
                Ok(())
            }
            Self::Stream { .. } | Self::Request { .. } => Ok(()),
        }
    }

    /// Closes the underlying device.
    pub fn close(&self) {
        match self {
            Self::KeyValue { store, .. } => store.close(),
            Self::Stream { requester, .. } | Self::Request { requester, .. } => {
                requester.device().close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn entry(interface: &str, device_type: &str, device_name: &str) -> MachineInterfaceEntry {
        MachineInterfaceEntry {
            interface_type: interface.to_owned(),
            device_type: device_type.to_owned(),
            device_name: device_name.to_owned(),
            data_type: "sample".to_owned(),
            keys: vec!["calibration".to_owned()],
        }
    }

    #[rstest]
    #[case("publish", DeliveryStrategy::Push, true)]
    #[case("frame-request", DeliveryStrategy::PollOnRequest, true)]
    #[case("run-script", DeliveryStrategy::PollOnRequest, false)]
    fn entries_map_to_descriptors(
        #[case] interface: &str,
        #[case] strategy: DeliveryStrategy,
        #[case] streaming: bool,
    ) {
        let descriptor =
            CapabilityDescriptor::from_entry(&entry(interface, "camera", "front")).expect("known");
        assert_eq!(descriptor.strategy, strategy);
        assert_eq!(descriptor.is_streaming(), streaming);
        assert_eq!(descriptor.address, Address::new("camera", "front"));
    }

    #[rstest]
    fn unknown_interface_types_are_rejected() {
        assert!(CapabilityDescriptor::from_entry(&entry("teleport", "arm", "")).is_none());
    }

    #[rstest]
    #[case(InterfaceType::KeyValueRequest, "key-value-request")]
    #[case(InterfaceType::UrCommand, "ur-command")]
    #[case(InterfaceType::MachineInterfacesRequest, "machine-interfaces-request")]
    fn interface_names_are_kebab_case(#[case] interface: InterfaceType, #[case] name: &str) {
        assert_eq!(interface.to_string(), name);
        assert_eq!(name.parse::<InterfaceType>().ok(), Some(interface));
    }
}
