//! Device dispatch and session engine for robot-control hosts.
//!
//! A robot-control host publishes a stream of newline-delimited JSON
//! messages, each addressed to a device, and accepts commands in the same
//! framing. This crate connects to such a host over TCP, through a spawned
//! bridge tool, or from a recorded log, and turns the stream into a set of
//! typed device handles:
//!
//! - [`Host`] owns the transport, routes inbound data by address and runs
//!   start-up: discovery of the capability catalogue, one device per
//!   capability, and a barrier that waits for the first sample of every
//!   stream.
//! - [`Device`] fans each sample out to ordered subscribers and caches the
//!   latest value per data type.
//! - [`Requester`] correlates commands with their replies by tag and drives
//!   periodic requests for polled streams.
//! - [`SessionManager`] tracks which client holds the control session.
//! - [`Playback`] steps and seeks through a recorded log.
//!
//! Everything runs on plain threads. Callbacks are invoked on the dispatcher
//! thread in registration order and may return [`Flow`] to unsubscribe
//! themselves. Lifecycle events reach a [`HealthReporter`], and timings and
//! counters accumulate in a [`MetricsRegistry`].
//!
//! [`bootstrap()`] wires configuration from [`tether_config`], structured
//! telemetry and a connected host in one call.

mod barrier;
mod bootstrap;
mod capability;
mod device;
mod discovery;
mod fanout;
mod health;
mod host;
mod keyvalue;
mod metrics;
mod ping;
mod playback;
mod poll;
mod requester;
mod session;
mod telemetry;
pub mod transport;

pub use barrier::{BarrierOutcome, StartupBarrier};
pub use bootstrap::{
    BootstrapError, ConfigLoader, Runtime, SystemConfigLoader, bootstrap, bootstrap_with,
};
pub use capability::{
    Capability, CapabilityDescriptor, CapabilityTimings, DeliveryStrategy, InterfaceType,
};
pub use device::{CommandSink, Device};
pub use discovery::{
    CapabilityCatalogue, CatalogueCell, DISCOVERY_AGGREGATOR, Discovery, MACHINE_INTERFACES,
    MACHINE_INTERFACES_REQUEST,
};
pub use fanout::{Fanout, Flow, Subscription};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use host::{DISPLAY_NAME, Host, HostError, ROBOT_NAME, SETTINGS_ENGINE};
pub use keyvalue::KeyValueDevice;
pub use metrics::{MetricsRegistry, MetricsSnapshot, TimerGuard, TimerStats};
pub use ping::{PING, PingDevice};
pub use playback::{Playback, SeekError};
pub use poll::{PollSet, StopSignal, TimerHandle};
pub use requester::{Correlation, Outcome, RequestError, Requester};
pub use session::{SESSION_MANAGER, SessionManager, SessionState, derive_state};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
