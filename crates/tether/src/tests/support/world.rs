//! Scenario world for suites that run a [`Host`] against a [`FakeHost`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::discovery::CapabilityCatalogue;
use crate::host::{Host, HostError};
use crate::metrics::MetricsRegistry;

use super::fake_host::{FakeHost, Script};
use super::loopback_config;
use super::reporter::RecordingHealthReporter;

type ConnectOutcome = Result<Arc<CapabilityCatalogue>, HostError>;

/// Host, fake peer and recorded outcomes shared across steps.
pub struct HostWorld {
    pub script: Script,
    pub reporter: Arc<RecordingHealthReporter>,
    host: Option<Arc<Host>>,
    fake: Option<FakeHost>,
    background: Option<JoinHandle<ConnectOutcome>>,
    outcome: Option<ConnectOutcome>,
}

impl HostWorld {
    pub fn new() -> Self {
        Self {
            script: Script::default(),
            reporter: Arc::new(RecordingHealthReporter::default()),
            host: None,
            fake: None,
            background: None,
            outcome: None,
        }
    }

    fn open(&mut self) -> Arc<Host> {
        let fake = FakeHost::start(self.script.clone());
        let config = loopback_config(fake.address());
        let host = Host::open(config, MetricsRegistry::new(), self.reporter.clone())
            .expect("host should open against the fake host");
        let shared = Arc::new(host);
        self.fake = Some(fake);
        self.host = Some(Arc::clone(&shared));
        shared
    }

    /// Opens the host and blocks in `connect`.
    pub fn connect(&mut self) {
        let host = self.open();
        self.outcome = Some(host.connect());
    }

    /// Opens the host and runs `connect` on another thread.
    pub fn connect_in_background(&mut self) {
        let host = self.open();
        self.background = Some(thread::spawn(move || host.connect()));
    }

    /// Closes the host after `delay` and collects a background outcome.
    pub fn close_after(&mut self, delay: Duration) {
        thread::sleep(delay);
        self.host().close();
        if let Some(handle) = self.background.take() {
            self.outcome = Some(handle.join().expect("connect thread panicked"));
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        self.host.as_ref().expect("host should be open")
    }

    pub fn fake(&self) -> &FakeHost {
        self.fake.as_ref().expect("fake host should be running")
    }

    pub fn outcome(&self) -> &ConnectOutcome {
        self.outcome.as_ref().expect("connect should have finished")
    }
}

impl Drop for HostWorld {
    fn drop(&mut self) {
        if let Some(host) = self.host.take() {
            host.close();
        }
        if let Some(handle) = self.background.take() {
            let _outcome = handle.join();
        }
        self.fake.take();
    }
}
