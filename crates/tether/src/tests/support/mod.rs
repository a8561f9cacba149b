//! Test harness utilities for the host behavioural suites.

mod fake_host;
mod reporter;
mod world;

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use tether_config::{Config, Endpoint, Timings};

pub use fake_host::{FakeHost, Script};
pub use reporter::{HealthEvent, RecordingHealthReporter};
pub use world::HostWorld;

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Timings short enough for loopback scenarios.
pub fn fast_timings() -> Timings {
    Timings {
        heartbeat_interval_ms: 20,
        heartbeat_timeout_ms: 2_000,
        read_timeout_ms: 20,
        connect_timeout_ms: 1_000,
        discovery_retry_ms: 40,
        session_poll_ms: 20,
        session_request_retry_ms: 60,
        key_value_retry_ms: 60,
        untagged_resend_ms: 40,
        stream_poll_ms: 30,
        ping_period_ms: 50,
        ping_retry_ms: 200,
        bridge_handshake_timeout_ms: 1_000,
        bridge_signal_grace_ms: 200,
    }
}

/// Configuration pointing at a loopback fake host.
pub fn loopback_config(address: SocketAddr) -> Config {
    Config {
        endpoint: Endpoint::tcp(address.ip().to_string(), address.port()),
        ..Config::default()
    }
    .with_timings(fast_timings())
}
