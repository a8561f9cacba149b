//! Structured health reporting for host lifecycle events.

use std::sync::Arc;

use tether_config::Endpoint;

use crate::session::SessionState;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before the transport is opened.
    fn connecting(&self, endpoint: &Endpoint);

    /// Invoked once a capability catalogue is available.
    fn discovery_completed(&self, capabilities: usize);

    /// Invoked when every streaming capability has reported once.
    fn startup_complete(&self);

    /// Invoked on every session state change.
    fn session_changed(&self, state: SessionState);

    /// Invoked when the transport closes underneath the host.
    fn transport_closed(&self);

    /// Invoked when the host has been closed.
    fn closed(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn connecting(&self, endpoint: &Endpoint) {
        (**self).connecting(endpoint);
    }

    fn discovery_completed(&self, capabilities: usize) {
        (**self).discovery_completed(capabilities);
    }

    fn startup_complete(&self) {
        (**self).startup_complete();
    }

    fn session_changed(&self, state: SessionState) {
        (**self).session_changed(state);
    }

    fn transport_closed(&self) {
        (**self).transport_closed();
    }

    fn closed(&self) {
        (**self).closed();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn connecting(&self, endpoint: &Endpoint) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "connecting",
            endpoint = %endpoint,
            "opening host connection"
        );
    }

    fn discovery_completed(&self, capabilities: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "discovery_completed",
            capabilities,
            "capability catalogue received"
        );
    }

    fn startup_complete(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "startup_complete",
            "every stream reported"
        );
    }

    fn session_changed(&self, state: SessionState) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "session_changed",
            state = %state,
            "session state changed"
        );
    }

    fn transport_closed(&self) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "transport_closed",
            "transport closed"
        );
    }

    fn closed(&self) {
        tracing::info!(target: HEALTH_TARGET, event = "closed", "host closed");
    }
}
