//! Byte-level connections to the robot-control host.
//!
//! Every transport queues outbound [`Command`]s without blocking and exposes
//! inbound [`Data`] through a pollable [`Transport::receive`]. Faults inside a
//! transport never cross this boundary as errors: they collapse into a single
//! [`Received::Closed`] that stays sticky once observed.
//!
//! Three implementations exist:
//!
//! * [`SocketTransport`] talks to a host over TCP with heartbeat-supervised
//!   reader and serializer threads.
//! * [`BridgeTransport`] spawns an external connector tool, learns the data
//!   server address from its first stdout line and then behaves like a socket.
//! * [`ReplayTransport`] plays a recorded log back on demand, optionally as
//!   one recorded client saw it.

mod bridge;
mod errors;
mod heartbeat;
mod queue;
mod replay;
mod simulator;
mod socket;

use std::fmt;
use std::time::Duration;

use tether_wire::{Command, Data};

pub use bridge::BridgeTransport;
pub use errors::{BridgeError, ReplayError, TransportError};
pub use heartbeat::Heartbeat;
pub use queue::InboundQueue;
pub use replay::{ReplayLog, ReplayTransport};
pub use simulator::ClientSimulator;
pub use socket::SocketTransport;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Result of one dequeue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// One decoded inbound message.
    Data(Data),
    /// Nothing arrived before the timeout.
    Timeout,
    /// The transport is permanently closed and fully drained.
    Closed,
}

impl Received {
    /// Returns `true` for [`Received::Closed`].
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Connection to a host or a recorded stream.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queues `command` for serialization. Never blocks on the network.
    fn send(&self, command: Command);

    /// Waits up to `timeout` for the next inbound message.
    fn receive(&self, timeout: Duration) -> Received;

    /// Discards buffered inbound messages, returning how many were dropped.
    fn drain(&self) -> usize;

    /// Releases every resource. Idempotent.
    fn close(&self);

    /// Returns `true` once the transport can no longer deliver new data.
    fn is_closed(&self) -> bool;
}
