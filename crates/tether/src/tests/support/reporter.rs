//! Test double for [`HealthReporter`] that records lifecycle events for
//! assertions.

use std::sync::Mutex;

use tether_config::Endpoint;

use crate::health::HealthReporter;
use crate::session::SessionState;

/// Lifecycle events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Connecting(Endpoint),
    DiscoveryCompleted(usize),
    StartupComplete,
    SessionChanged(SessionState),
    TransportClosed,
    Closed,
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    pub fn contains(&self, event: &HealthEvent) -> bool {
        self.events().contains(event)
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn connecting(&self, endpoint: &Endpoint) {
        self.record(HealthEvent::Connecting(endpoint.clone()));
    }

    fn discovery_completed(&self, capabilities: usize) {
        self.record(HealthEvent::DiscoveryCompleted(capabilities));
    }

    fn startup_complete(&self) {
        self.record(HealthEvent::StartupComplete);
    }

    fn session_changed(&self, state: SessionState) {
        self.record(HealthEvent::SessionChanged(state));
    }

    fn transport_closed(&self) {
        self.record(HealthEvent::TransportClosed);
    }

    fn closed(&self) {
        self.record(HealthEvent::Closed);
    }
}
