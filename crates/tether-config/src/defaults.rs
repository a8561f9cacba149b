use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::logging::LogFormat;

/// Port a locally running host listens on.
pub const DEFAULT_TCP_PORT: u16 = 50008;

/// Host name used when none is configured.
pub const DEFAULT_TCP_HOST: &str = "localhost";

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Interval between liveness beats sent to supervised socket threads.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// Silence after which a supervised socket thread terminates itself.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);
/// Blocking read timeout applied to host sockets.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay between capability discovery attempts.
pub const DISCOVERY_RETRY: Duration = Duration::from_secs(15);
/// Session manager poll period.
pub const SESSION_POLL: Duration = Duration::from_secs(1);
/// Minimum spacing between repeated session requests.
pub const SESSION_REQUEST_RETRY: Duration = Duration::from_secs(15);
/// Delay before an unanswered key-value read is repeated.
pub const KEY_VALUE_RETRY: Duration = Duration::from_secs(15);
/// Resend period for untagged frame requests.
pub const UNTAGGED_RESEND: Duration = Duration::from_secs(1);
/// Period of the untagged poll run for poll-on-request capabilities.
pub const STREAM_POLL: Duration = Duration::from_secs(1);
/// Ping period.
pub const PING_PERIOD: Duration = Duration::from_secs(1);
/// Age after which an unanswered ping is replaced.
pub const PING_RETRY: Duration = Duration::from_secs(15);
/// Budget for a bridge tool to print its handshake line.
pub const BRIDGE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Wait applied after each shutdown signal sent to a bridge tool.
pub const BRIDGE_SIGNAL_GRACE: Duration = Duration::from_secs(10);

/// Default endpoint: a host on the local machine.
#[must_use]
pub fn default_endpoint() -> Endpoint {
    Endpoint::tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT)
}

/// Owned log filter value used where serde needs a constructor.
#[must_use]
pub fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}
