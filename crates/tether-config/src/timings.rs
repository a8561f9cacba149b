use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Timing knobs of the engine, stored as milliseconds.
///
/// Every field falls back to its default when omitted from a configuration
/// file, so partial tables are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timings {
    /// Liveness beat interval for socket threads.
    pub heartbeat_interval_ms: u64,
    /// Silence tolerated before a socket thread terminates itself.
    pub heartbeat_timeout_ms: u64,
    /// Blocking socket read timeout.
    pub read_timeout_ms: u64,
    /// TCP connect budget.
    pub connect_timeout_ms: u64,
    /// Delay between discovery attempts.
    pub discovery_retry_ms: u64,
    /// Session manager poll period.
    pub session_poll_ms: u64,
    /// Minimum spacing between repeated session requests.
    pub session_request_retry_ms: u64,
    /// Delay before an unanswered key-value read is repeated.
    pub key_value_retry_ms: u64,
    /// Resend period for untagged frame requests.
    pub untagged_resend_ms: u64,
    /// Untagged poll period for poll-on-request capabilities.
    pub stream_poll_ms: u64,
    /// Ping period.
    pub ping_period_ms: u64,
    /// Age after which an unanswered ping is replaced.
    pub ping_retry_ms: u64,
    /// Budget for a bridge tool's handshake line.
    pub bridge_handshake_timeout_ms: u64,
    /// Wait after each shutdown signal sent to a bridge tool.
    pub bridge_signal_grace_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: millis(defaults::HEARTBEAT_INTERVAL),
            heartbeat_timeout_ms: millis(defaults::HEARTBEAT_TIMEOUT),
            read_timeout_ms: millis(defaults::READ_TIMEOUT),
            connect_timeout_ms: millis(defaults::CONNECT_TIMEOUT),
            discovery_retry_ms: millis(defaults::DISCOVERY_RETRY),
            session_poll_ms: millis(defaults::SESSION_POLL),
            session_request_retry_ms: millis(defaults::SESSION_REQUEST_RETRY),
            key_value_retry_ms: millis(defaults::KEY_VALUE_RETRY),
            untagged_resend_ms: millis(defaults::UNTAGGED_RESEND),
            stream_poll_ms: millis(defaults::STREAM_POLL),
            ping_period_ms: millis(defaults::PING_PERIOD),
            ping_retry_ms: millis(defaults::PING_RETRY),
            bridge_handshake_timeout_ms: millis(defaults::BRIDGE_HANDSHAKE_TIMEOUT),
            bridge_signal_grace_ms: millis(defaults::BRIDGE_SIGNAL_GRACE),
        }
    }
}

impl Timings {
    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Socket read timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// TCP connect budget.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Discovery retry interval.
    #[must_use]
    pub const fn discovery_retry(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_ms)
    }

    /// Session poll period.
    #[must_use]
    pub const fn session_poll(&self) -> Duration {
        Duration::from_millis(self.session_poll_ms)
    }

    /// Session request retry interval.
    #[must_use]
    pub const fn session_request_retry(&self) -> Duration {
        Duration::from_millis(self.session_request_retry_ms)
    }

    /// Key-value retry interval.
    #[must_use]
    pub const fn key_value_retry(&self) -> Duration {
        Duration::from_millis(self.key_value_retry_ms)
    }

    /// Untagged resend period.
    #[must_use]
    pub const fn untagged_resend(&self) -> Duration {
        Duration::from_millis(self.untagged_resend_ms)
    }

    /// Poll-on-request stream period.
    #[must_use]
    pub const fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    /// Ping period.
    #[must_use]
    pub const fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    /// Ping retry age.
    #[must_use]
    pub const fn ping_retry(&self) -> Duration {
        Duration::from_millis(self.ping_retry_ms)
    }

    /// Bridge handshake budget.
    #[must_use]
    pub const fn bridge_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_handshake_timeout_ms)
    }

    /// Bridge signal grace.
    #[must_use]
    pub const fn bridge_signal_grace(&self) -> Duration {
        Duration::from_millis(self.bridge_signal_grace_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
