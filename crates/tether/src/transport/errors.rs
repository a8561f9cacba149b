//! Error types for opening transports.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use tether_wire::WireError;

/// Errors surfaced while connecting a socket transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Name resolution failed.
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
        /// Resolver failure.
        #[source]
        source: Arc<io::Error>,
    },
    /// Resolution produced no usable addresses.
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
    },
    /// The connection attempt failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Peer address.
        addr: SocketAddr,
        /// Connect failure.
        #[source]
        source: Arc<io::Error>,
    },
    /// A socket option could not be applied.
    #[error("failed to configure socket option {option}: {source}")]
    SocketOption {
        /// Option being set.
        option: &'static str,
        /// Underlying failure.
        #[source]
        source: Arc<io::Error>,
    },
    /// A worker thread could not be started.
    #[error("failed to spawn transport thread {name}: {source}")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying failure.
        #[source]
        source: Arc<io::Error>,
    },
    /// A worker thread panicked.
    #[error("transport thread {name} panicked")]
    ThreadPanic {
        /// Thread name.
        name: String,
    },
}

/// Errors surfaced while starting an external connector tool.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The tool could not be started.
    #[error("failed to spawn bridge tool {program}: {source}")]
    Spawn {
        /// Executable path.
        program: Utf8PathBuf,
        /// Spawn failure.
        #[source]
        source: io::Error,
    },
    /// A standard stream of the child was not captured.
    #[error("bridge tool {program} has no {stream} pipe")]
    MissingPipe {
        /// Executable path.
        program: Utf8PathBuf,
        /// Stream name.
        stream: &'static str,
    },
    /// The tool did not announce a data server in time.
    #[error("bridge tool {program} sent no handshake within {timeout:?}")]
    HandshakeTimeout {
        /// Executable path.
        program: Utf8PathBuf,
        /// Handshake deadline.
        timeout: Duration,
    },
    /// The tool exited before announcing a data server.
    #[error("bridge tool {program} closed stdout before the handshake")]
    HandshakeEof {
        /// Executable path.
        program: Utf8PathBuf,
    },
    /// The first stdout line was not a data server announcement.
    #[error("bridge tool {program} sent an invalid handshake: {source}")]
    Handshake {
        /// Executable path.
        program: Utf8PathBuf,
        /// Parse failure.
        #[source]
        source: WireError,
    },
    /// Connecting to the announced data server failed.
    #[error("failed to connect to bridge data server: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced while loading a recorded log.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The log directory does not exist or is not a directory.
    #[error("replay log directory {path} is missing")]
    MissingDirectory {
        /// Expected directory.
        path: Utf8PathBuf,
    },
    /// A log file could not be read.
    #[error("failed to read replay file {path}: {source}")]
    Read {
        /// File being read.
        path: Utf8PathBuf,
        /// Read failure.
        #[source]
        source: io::Error,
    },
    /// No `connected-clients` listing names the requested client.
    #[error("replay log never lists {}", .client.as_deref().unwrap_or("a client"))]
    ClientNotFound {
        /// Requested client, or `None` when any client would do.
        client: Option<String>,
    },
}
