//! Runtime configuration for the tether engine.
//!
//! [`Config`] is assembled by `ortho-config` from four layers, each replacing
//! only the values it names: built-in defaults, a TOML file (`--config-path`
//! or `TETHER_CONFIG_PATH`), `TETHER_*` environment variables and finally
//! command-line flags. The endpoint is written as a URL in every layer.

mod defaults;
mod endpoint;
mod logging;
mod timings;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::*;
pub use endpoint::{Endpoint, EndpointParseError, ReplayClient};
pub use logging::{LogFormat, LogFormatParseError};
pub use timings::Timings;

/// Resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "TETHER")]
#[serde(default)]
pub struct Config {
    /// Message stream source, e.g. `tcp://robot.local:50008`.
    pub endpoint: Endpoint,
    /// `tracing` filter expression.
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Ask for a control session as soon as the host starts.
    pub take_control_at_start: bool,
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

impl Default for Config {
    fn default() -> Self {
        let timings = Timings::default();
        Self {
            endpoint: default_endpoint(),
            log_filter: default_log_filter(),
            log_format: default_log_format(),
            take_control_at_start: false,
            heartbeat_interval_ms: timings.heartbeat_interval_ms,
            heartbeat_timeout_ms: timings.heartbeat_timeout_ms,
            read_timeout_ms: timings.read_timeout_ms,
            connect_timeout_ms: timings.connect_timeout_ms,
            discovery_retry_ms: timings.discovery_retry_ms,
            session_poll_ms: timings.session_poll_ms,
            session_request_retry_ms: timings.session_request_retry_ms,
            key_value_retry_ms: timings.key_value_retry_ms,
            untagged_resend_ms: timings.untagged_resend_ms,
            stream_poll_ms: timings.stream_poll_ms,
            ping_period_ms: timings.ping_period_ms,
            ping_retry_ms: timings.ping_retry_ms,
            bridge_handshake_timeout_ms: timings.bridge_handshake_timeout_ms,
            bridge_signal_grace_ms: timings.bridge_signal_grace_ms,
        }
    }
}

impl Config {
    /// Message stream source.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Log filter expression.
    #[must_use]
    pub const fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Timing knobs gathered from the `*_ms` fields.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        Timings {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            discovery_retry_ms: self.discovery_retry_ms,
            session_poll_ms: self.session_poll_ms,
            session_request_retry_ms: self.session_request_retry_ms,
            key_value_retry_ms: self.key_value_retry_ms,
            untagged_resend_ms: self.untagged_resend_ms,
            stream_poll_ms: self.stream_poll_ms,
            ping_period_ms: self.ping_period_ms,
            ping_retry_ms: self.ping_retry_ms,
            bridge_handshake_timeout_ms: self.bridge_handshake_timeout_ms,
            bridge_signal_grace_ms: self.bridge_signal_grace_ms,
        }
    }

    /// Replaces every timing knob.
    #[must_use]
    pub const fn with_timings(mut self, timings: Timings) -> Self {
        self.heartbeat_interval_ms = timings.heartbeat_interval_ms;
        self.heartbeat_timeout_ms = timings.heartbeat_timeout_ms;
        self.read_timeout_ms = timings.read_timeout_ms;
        self.connect_timeout_ms = timings.connect_timeout_ms;
        self.discovery_retry_ms = timings.discovery_retry_ms;
        self.session_poll_ms = timings.session_poll_ms;
        self.session_request_retry_ms = timings.session_request_retry_ms;
        self.key_value_retry_ms = timings.key_value_retry_ms;
        self.untagged_resend_ms = timings.untagged_resend_ms;
        self.stream_poll_ms = timings.stream_poll_ms;
        self.ping_period_ms = timings.ping_period_ms;
        self.ping_retry_ms = timings.ping_retry_ms;
        self.bridge_handshake_timeout_ms = timings.bridge_handshake_timeout_ms;
        self.bridge_signal_grace_ms = timings.bridge_signal_grace_ms;
        self
    }
}
