//! Round-trip latency measurement.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use tether_wire::{Address, Command, fresh_tag};

use crate::device::{CommandSink, DEVICE_TARGET, Device};
use crate::fanout::Flow;

/// `deviceType` and `dataType` of ping messages.
pub const PING: &str = "ping";

#[derive(Debug, Default)]
struct PingState {
    outstanding: Option<(String, Instant)>,
    round_trip: Option<Duration>,
}

/// Sends tagged pings and records the latest round-trip time.
#[derive(Debug)]
pub struct PingDevice {
    device: Arc<Device>,
    state: Arc<Mutex<PingState>>,
}

impl PingDevice {
    /// Creates the device; nothing is sent until [`PingDevice::start`].
    #[must_use]
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        let device = Arc::new(Device::new(Address::singleton(PING), sink));
        let state = Arc::new(Mutex::new(PingState::default()));
        let answers = Arc::clone(&state);
        device.subscribe(move |data| {
            let mut guard = answers.lock().unwrap_or_else(PoisonError::into_inner);
            let matched = match (&guard.outstanding, data.tag.as_deref()) {
                (Some((tag, sent)), Some(received)) if tag == received => Some(sent.elapsed()),
                _ => None,
            };
            if let Some(elapsed) = matched {
                trace!(
                    target: DEVICE_TARGET,
                    round_trip = ?elapsed,
                    "ping answered"
                );
                guard.round_trip = Some(elapsed);
                guard.outstanding = None;
            }
        });
        Self { device, state }
    }

    /// Underlying device.
    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Pings every `period`; an unanswered ping is replaced once older than
    /// `retry`.
    pub fn start(&self, period: Duration, retry: Duration) {
        let state = Arc::clone(&self.state);
        let device: Weak<Device> = Arc::downgrade(&self.device);
        self.device.poll(period, move || {
            let Some(live) = device.upgrade() else {
                return Flow::StopAndFinish;
            };
            let tag = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                if guard
                    .outstanding
                    .as_ref()
                    .is_some_and(|(_, sent)| sent.elapsed() < retry)
                {
                    return Flow::Continue;
                }
                let fresh = fresh_tag();
                guard.outstanding = Some((fresh.clone(), Instant::now()));
                fresh
            };
            live.send(Command::new(Address::singleton(PING), PING).with_tag(tag));
            Flow::Continue
        });
    }

    /// Latest measured round-trip time.
    #[must_use]
    pub fn ping_time(&self) -> Option<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .round_trip
    }

    /// Stops pinging.
    pub fn close(&self) {
        self.device.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::rstest;

    use tether_wire::Data;

    use super::*;
    use crate::device::MockCommandSink;

    #[rstest]
    fn answered_ping_records_round_trip() {
        let (sender, receiver) = std::sync::mpsc::channel::<Command>();
        let shared_sender = Mutex::new(sender);
        let mut sink = MockCommandSink::new();
        sink.expect_send().returning(move |command| {
            shared_sender.lock().expect("lock").send(command).expect("send");
        });
        let ping = PingDevice::new(Arc::new(sink));
        assert!(ping.ping_time().is_none());
        ping.start(Duration::from_millis(10), Duration::from_secs(15));
        let sent = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("ping should be sent");
        let tag = sent.tag.clone().expect("ping is tagged");
        assert_eq!(sent.address, Address::singleton(PING));
        thread::sleep(Duration::from_millis(5));
        ping.device()
            .deliver(&Data::new(Address::singleton(PING), PING).with_tag(tag));
        assert!(ping.ping_time().is_some_and(|rtt| rtt >= Duration::from_millis(5)));
        ping.close();
    }

    #[rstest]
    fn outstanding_ping_is_not_repeated_before_retry() {
        let (sender, receiver) = std::sync::mpsc::channel::<Command>();
        let shared_sender = Mutex::new(sender);
        let mut sink = MockCommandSink::new();
        sink.expect_send().returning(move |command| {
            shared_sender.lock().expect("lock").send(command).expect("send");
        });
        let ping = PingDevice::new(Arc::new(sink));
        ping.start(Duration::from_millis(5), Duration::from_secs(15));
        receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("first ping");
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        ping.close();
    }
}
