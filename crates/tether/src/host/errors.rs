//! Errors surfaced by the host orchestrator.

use std::io;

use thiserror::Error;

use crate::requester::RequestError;
use crate::transport::{BridgeError, ReplayError, TransportError};

/// Failures while opening or starting a host.
#[derive(Debug, Error)]
pub enum HostError {
    /// The socket transport could not connect.
    #[error("failed to open socket transport: {0}")]
    Transport(#[from] TransportError),
    /// The bridge tool could not be started or connected.
    #[error("failed to open bridge transport: {0}")]
    Bridge(#[from] BridgeError),
    /// The replay log could not be loaded.
    #[error("failed to open replay log: {0}")]
    Replay(#[from] ReplayError),
    /// The replay log holds no capability catalogue.
    #[error("replay log has no machine-interfaces record")]
    MissingCatalogue,
    /// A capability refused to start.
    #[error("failed to start capability: {0}")]
    Capability(#[from] RequestError),
    /// The dispatcher thread could not be started.
    #[error("failed to spawn dispatcher thread: {source}")]
    Spawn {
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// `connect` was called more than once.
    #[error("host is already connected")]
    AlreadyConnected,
    /// The host or its transport closed before start-up finished.
    #[error("host closed during start-up")]
    Closed,
}
