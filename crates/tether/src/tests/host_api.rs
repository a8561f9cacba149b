//! Host API checks against a loopback host.

use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};

use tether_wire::Address;

use crate::host::{Host, HostError};
use crate::metrics::MetricsRegistry;

use super::support::{
    FakeHost, HealthEvent, RecordingHealthReporter, Script, loopback_config, wait_until,
};

const PATIENCE: Duration = Duration::from_secs(3);

struct Connected {
    host: Host,
    fake: FakeHost,
    reporter: Arc<RecordingHealthReporter>,
    metrics: MetricsRegistry,
}

#[fixture]
fn connected() -> Connected {
    let fake = FakeHost::start(
        Script::default()
            .interface("publish", "arm", "", "joint-state")
            .push_stream(Address::singleton("arm"), "joint-state")
            .interface("run-script", "arm", "", "script")
            .client("me", true, false),
    );
    let reporter = Arc::new(RecordingHealthReporter::default());
    let metrics = MetricsRegistry::new();
    let host = Host::open(
        loopback_config(fake.address()),
        metrics.clone(),
        reporter.clone(),
    )
    .expect("open host");
    host.connect().expect("connect host");
    Connected {
        host,
        fake,
        reporter,
        metrics,
    }
}

#[rstest]
fn connecting_twice_is_rejected(connected: Connected) {
    assert!(matches!(
        connected.host.connect(),
        Err(HostError::AlreadyConnected)
    ));
}

#[rstest]
fn request_capabilities_do_not_hold_up_startup(connected: Connected) {
    let capabilities = connected.host.capabilities();
    assert_eq!(capabilities.len(), 2);
    assert_eq!(
        capabilities
            .iter()
            .filter(|capability| capability.is_streaming())
            .count(),
        1
    );
}

#[rstest]
fn pings_measure_round_trips(connected: Connected) {
    assert!(wait_until(PATIENCE, || connected.host.ping_time().is_some()));
}

#[rstest]
fn metrics_count_traffic_and_seal_on_close(connected: Connected) {
    let before = connected.metrics.snapshot();
    assert!(before.data_received > 0);
    assert!(before.commands_sent > 0);
    assert!(before.discovery_attempts >= 1);
    assert!(before.timers.contains_key("startup"));
    connected.host.close();
    let after = connected.metrics.snapshot();
    assert!(after.sealed);
    connected.metrics.data_received();
    assert_eq!(connected.metrics.snapshot().data_received, after.data_received);
}

#[rstest]
fn close_is_idempotent_and_reported_once(connected: Connected) {
    connected.host.close();
    connected.host.close();
    let closes = connected
        .reporter
        .events()
        .iter()
        .filter(|event| **event == HealthEvent::Closed)
        .count();
    assert_eq!(closes, 1);
    assert!(matches!(connected.host.connect(), Err(HostError::Closed)));
}

#[rstest]
fn closed_hosts_send_nothing(connected: Connected) {
    connected.host.close();
    std::thread::sleep(Duration::from_millis(50));
    let sent = connected.fake.commands().len();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(connected.fake.commands().len(), sent);
}
