//! Host orchestrator.
//!
//! A [`Host`] owns the transport, every device, the session manager and the
//! start-up barrier. Inbound data is routed by address on a dedicated
//! dispatcher thread (live hosts) or synchronously by [`Playback`] (replay
//! hosts). Outbound commands from every device share one
//! [`CommandSink`] backed by the transport.
//!
//! Start-up is split in two so that another thread can abort it:
//! [`Host::open`] connects the transport and returns immediately, and
//! [`Host::connect`] blocks through discovery and the start-up barrier until
//! every streaming capability has produced one sample or [`Host::close`] runs.

mod errors;
mod router;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use tether_config::{Config, Endpoint, ReplayClient};
use tether_wire::{Address, Command, Data};

pub use errors::HostError;
use router::Router;

use crate::barrier::{BarrierOutcome, StartupBarrier};
use crate::capability::{Capability, CapabilityTimings, InterfaceType};
use crate::device::{CommandSink, Device};
use crate::discovery::{CapabilityCatalogue, Discovery};
use crate::fanout::{Flow, Subscription};
use crate::health::HealthReporter;
use crate::keyvalue::KeyValueDevice;
use crate::metrics::MetricsRegistry;
use crate::ping::PingDevice;
use crate::playback::Playback;
use crate::session::{SessionManager, SessionState};
use crate::transport::{
    BridgeTransport, Received, ReplayLog, ReplayTransport, SocketTransport, Transport,
};

pub(crate) const HOST_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// `deviceType` of the host's settings store.
pub const SETTINGS_ENGINE: &str = "settings-engine";
/// Settings key holding the robot identifier.
pub const ROBOT_NAME: &str = "robot-name";
/// Settings key holding the human-readable robot name.
pub const DISPLAY_NAME: &str = "display-name";

const DISPATCH_WAIT: Duration = Duration::from_millis(100);

/// Command sink that counts and forwards to the transport.
struct TransportSink {
    transport: Arc<dyn Transport>,
    metrics: MetricsRegistry,
}

impl CommandSink for TransportSink {
    fn send(&self, command: Command) {
        self.metrics.command_sent();
        self.transport.send(command);
    }
}

/// State shared between the host handle and its dispatcher thread.
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    router: Router,
    metrics: MetricsRegistry,
    health: Arc<dyn HealthReporter>,
    barrier: Mutex<Option<Arc<StartupBarrier>>>,
    closed: AtomicBool,
}

impl Shared {
    /// Routes one inbound message and records it.
    pub(crate) fn dispatch(&self, data: &Data) {
        self.metrics.data_received();
        let started = Instant::now();
        if self.router.route(data) == 0 {
            self.metrics.data_unrouted();
            trace!(
                target: HOST_TARGET,
                address = %data.address,
                data_type = %data.data_type,
                "no device for data"
            );
        }
        self.metrics.dispatch_time(started.elapsed());
    }

    /// Drops buffered inbound data without dispatching it.
    pub(crate) fn flush(&self) -> usize {
        let dropped = self.transport.drain();
        if dropped > 0 {
            debug!(target: HOST_TARGET, dropped, "flushed inbound data");
        }
        dropped
    }

    fn abort_barrier(&self) {
        let barrier = self.barrier.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(waiting) = barrier {
            waiting.abort();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transport_lost(&self) {
        if self.is_closed() {
            return;
        }
        self.health.transport_closed();
        self.abort_barrier();
        self.router.close_all();
    }
}

/// Orchestrates one connection to a robot-control host.
pub struct Host {
    config: Config,
    shared: Arc<Shared>,
    replay: Option<Arc<ReplayTransport>>,
    sink: Arc<dyn CommandSink>,
    discovery: Discovery,
    session: SessionManager,
    settings: Arc<KeyValueDevice>,
    ping: Option<PingDevice>,
    capabilities: RwLock<Option<Vec<Arc<Capability>>>>,
    connect_started: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Host {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Host")
            .field("endpoint", self.config.endpoint())
            .field("playback", &self.replay.is_some())
            .field("session", &self.session.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Opens the transport named by the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the transport cannot be opened.
    pub fn open(
        config: Config,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Result<Self, HostError> {
        health.connecting(config.endpoint());
        match config.endpoint().clone() {
            Endpoint::Tcp { host, port } => {
                let transport = SocketTransport::connect(&host, port, &config.timings())?;
                Self::with_transport(config, Arc::new(transport), metrics, health)
            }
            Endpoint::Bridge { program, args } => {
                let transport = BridgeTransport::spawn(&program, &args, &config.timings())?;
                Self::with_transport(config, Arc::new(transport), metrics, health)
            }
            Endpoint::Replay { directory, client } => {
                let log = ReplayLog::load_directory(&directory)?;
                match client {
                    Some(client) => {
                        Self::with_replay_client(config, log, &client, metrics, health)
                    }
                    None => Ok(Self::with_replay_log(config, log, metrics, health)),
                }
            }
        }
    }

    /// Builds a live host over an already open transport and starts the
    /// dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] when the dispatcher cannot start.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Result<Self, HostError> {
        let host = Self::assemble(config, transport, None, metrics, health);
        let shared = Arc::clone(&host.shared);
        let handle = thread::Builder::new()
            .name("tether-dispatch".to_owned())
            .spawn(move || run_dispatcher(&shared))
            .map_err(|source| HostError::Spawn { source })?;
        *host.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(host)
    }

    /// Builds a playback host over a recorded log.
    #[must_use]
    pub fn with_replay_log(
        config: Config,
        log: ReplayLog,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        Self::over_replay(config, ReplayTransport::new(log), metrics, health)
    }

    /// Builds a playback host that sees the log as one recorded client did.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Replay`] when the log never lists the client.
    pub fn with_replay_client(
        config: Config,
        log: ReplayLog,
        client: &ReplayClient,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Result<Self, HostError> {
        let replay = ReplayTransport::simulating(log, client)?;
        Ok(Self::over_replay(config, replay, metrics, health))
    }

    fn over_replay(
        config: Config,
        replay: ReplayTransport,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        let replay = Arc::new(replay);
        let transport: Arc<dyn Transport> = replay.clone();
        Self::assemble(config, transport, Some(replay), metrics, health)
    }

    fn assemble(
        config: Config,
        transport: Arc<dyn Transport>,
        replay: Option<Arc<ReplayTransport>>,
        metrics: MetricsRegistry,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        let timings = config.timings();
        let sink: Arc<dyn CommandSink> = Arc::new(TransportSink {
            transport: Arc::clone(&transport),
            metrics: metrics.clone(),
        });
        let shared = Arc::new(Shared {
            transport,
            router: Router::default(),
            metrics,
            health,
            barrier: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let discovery = Discovery::new(Arc::clone(&sink), timings.discovery_retry());
        let session = if replay.is_some() {
            SessionManager::playback(Arc::clone(&sink))
        } else {
            SessionManager::new(
                Arc::clone(&sink),
                config.take_control_at_start,
                timings.session_request_retry(),
            )
        };
        let reporter = Arc::clone(&shared.health);
        session.add_update_callback(
            move |state| {
                reporter.session_changed(*state);
                Flow::Continue
            },
            || {},
        );
        let settings = Arc::new(KeyValueDevice::new(
            Arc::new(Device::new(Address::singleton(SETTINGS_ENGINE), Arc::clone(&sink))),
            [ROBOT_NAME.to_owned(), DISPLAY_NAME.to_owned()],
            timings.key_value_retry(),
        ));
        let ping = replay
            .is_none()
            .then(|| PingDevice::new(Arc::clone(&sink)));

        shared.router.register(Arc::clone(discovery.device()));
        shared.router.register(Arc::clone(session.device()));
        shared.router.register(Arc::clone(settings.device()));
        if let Some(pinger) = &ping {
            shared.router.register(Arc::clone(pinger.device()));
        }

        Self {
            config,
            shared,
            replay,
            sink,
            discovery,
            session,
            settings,
            ping,
            capabilities: RwLock::new(None),
            connect_started: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        }
    }

    /// Runs discovery, builds and starts one device per capability and
    /// waits until every streaming capability has reported once.
    ///
    /// Returns the catalogue the devices were built from. A playback host
    /// takes its catalogue from the log and does not wait.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Closed`] when the host or transport closes first,
    /// [`HostError::MissingCatalogue`] for a log without a catalogue,
    /// [`HostError::AlreadyConnected`] on a second call, and
    /// [`HostError::Capability`] when a capability refuses to start.
    pub fn connect(&self) -> Result<Arc<CapabilityCatalogue>, HostError> {
        if self.is_closed() {
            return Err(HostError::Closed);
        }
        if self.connect_started.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyConnected);
        }
        let timer = self.shared.metrics.time("startup");
        let catalogue = match &self.replay {
            Some(replay) => self.adopt_recorded_catalogue(replay)?,
            None => self.discover()?,
        };
        self.shared.health.discovery_completed(catalogue.len());

        let capabilities = self.build_capabilities(&catalogue);
        if self.replay.is_some() {
            self.store_capabilities(capabilities);
            drop(timer);
            self.shared.health.startup_complete();
            return Ok(catalogue);
        }

        let barrier = Arc::new(StartupBarrier::new(
            capabilities.iter().filter(|capability| capability.is_streaming()).count(),
        ));
        for capability in capabilities.iter().filter(|capability| capability.is_streaming()) {
            arm_first_sample(capability, &barrier);
        }
        *self
            .shared
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&barrier));
        if self.is_closed() || self.shared.transport.is_closed() {
            barrier.abort();
        }
        let stream_poll = self.config.timings().stream_poll();
        for capability in &capabilities {
            capability.start(stream_poll)?;
        }
        self.store_capabilities(capabilities);
        info!(
            target: HOST_TARGET,
            streams = barrier.expected(),
            "waiting for first samples"
        );
        let outcome = barrier.wait();
        self.shared
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(timer);
        match outcome {
            BarrierOutcome::Complete => {
                self.shared.health.startup_complete();
                Ok(catalogue)
            }
            BarrierOutcome::Aborted | BarrierOutcome::TimedOut => Err(HostError::Closed),
        }
    }

    fn discover(&self) -> Result<Arc<CapabilityCatalogue>, HostError> {
        let timings = self.config.timings();
        self.session.start(timings.session_poll());
        self.settings.start();
        if let Some(pinger) = &self.ping {
            pinger.start(timings.ping_period(), timings.ping_retry());
        }
        let _discovery_timer = self.shared.metrics.time("discovery");
        self.discovery.start(self.shared.metrics.clone());
        self.discovery.wait(None).ok_or(HostError::Closed)
    }

    fn adopt_recorded_catalogue(
        &self,
        replay: &ReplayTransport,
    ) -> Result<Arc<CapabilityCatalogue>, HostError> {
        let record = replay
            .log()
            .catalogue_record()
            .cloned()
            .ok_or(HostError::MissingCatalogue)?;
        self.discovery.device().deliver(&record);
        self.discovery
            .catalogue()
            .current()
            .ok_or(HostError::MissingCatalogue)
    }

    fn build_capabilities(&self, catalogue: &CapabilityCatalogue) -> Vec<Arc<Capability>> {
        let timings = self.config.timings();
        let capability_timings = CapabilityTimings {
            untagged_resend: timings.untagged_resend(),
            key_value_retry: timings.key_value_retry(),
        };
        catalogue
            .capabilities()
            .iter()
            .map(|descriptor| {
                let capability = Arc::new(Capability::build(
                    descriptor.clone(),
                    Arc::clone(&self.sink),
                    capability_timings,
                ));
                self.shared.router.register(Arc::clone(capability.device()));
                debug!(target: HOST_TARGET, capability = %descriptor, "capability ready");
                capability
            })
            .collect()
    }

    fn store_capabilities(&self, capabilities: Vec<Arc<Capability>>) {
        *self.capabilities.write().unwrap_or_else(PoisonError::into_inner) = Some(capabilities);
        if self.is_closed() {
            self.close_capabilities();
        }
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics handle owned by this host.
    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.shared.metrics
    }

    /// Current capability catalogue.
    #[must_use]
    pub fn catalogue(&self) -> Option<Arc<CapabilityCatalogue>> {
        self.discovery.catalogue().current()
    }

    /// Capability devices built by [`Host::connect`].
    #[must_use]
    pub fn capabilities(&self) -> Vec<Arc<Capability>> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Looks up one capability device.
    #[must_use]
    pub fn capability(
        &self,
        address: &Address,
        interface: InterfaceType,
    ) -> Option<Arc<Capability>> {
        self.capabilities().into_iter().find(|capability| {
            let descriptor = capability.descriptor();
            &descriptor.address == address && descriptor.interface == interface
        })
    }

    /// Every device listening on `address`.
    #[must_use]
    pub fn devices(&self, address: &Address) -> Vec<Arc<Device>> {
        self.shared.router.devices(address)
    }

    /// Registers an additional device built by a collaborator.
    pub fn register_device(&self, device: Arc<Device>) {
        self.shared.router.register(device);
    }

    /// Sink that sends through this host's transport.
    #[must_use]
    pub fn command_sink(&self) -> Arc<dyn CommandSink> {
        Arc::clone(&self.sink)
    }

    /// Playback controls, for hosts opened over a recorded log.
    #[must_use]
    pub fn playback(&self) -> Option<Playback> {
        self.replay
            .as_ref()
            .map(|replay| Playback::new(Arc::clone(replay), Arc::clone(&self.shared)))
    }

    /// Returns `true` for hosts opened over a recorded log.
    #[must_use]
    pub const fn is_playback(&self) -> bool {
        self.replay.is_some()
    }

    /// Current session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Records whether this client wants control. Advisory.
    pub fn set_should_take_control(&self, take_control: bool, release_control: bool) {
        self.session.set_should_take_control(take_control, release_control);
    }

    /// Blocks until `state` is observed or `timeout` elapses.
    #[must_use]
    pub fn wait_for_session_state(&self, state: SessionState, timeout: Duration) -> bool {
        self.session.wait_for_session_state(state, timeout)
    }

    /// Registers a subscriber for session state changes.
    pub fn add_session_callback<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&SessionState) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.session.add_update_callback(callback, finished)
    }

    /// Robot identifier reported by the settings store.
    #[must_use]
    pub fn robot_name(&self) -> Option<String> {
        self.settings.value(ROBOT_NAME)
    }

    /// Human-readable robot name reported by the settings store.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.settings.value(DISPLAY_NAME)
    }

    /// Blocks until the robot identifier is known or `timeout` elapses.
    #[must_use]
    pub fn wait_for_robot_name(&self, timeout: Duration) -> Option<String> {
        self.settings.wait_for_value(ROBOT_NAME, timeout)
    }

    /// Round-trip time of the latest answered ping.
    #[must_use]
    pub fn ping_time(&self) -> Option<Duration> {
        self.ping.as_ref().and_then(PingDevice::ping_time)
    }

    /// Discards buffered inbound data without dispatching it.
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Returns `true` once [`Host::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Finishes every subscriber, closes the transport and seals the
    /// metrics. Idempotent and safe to call from any thread, including
    /// while [`Host::connect`] is blocked.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: HOST_TARGET, "closing host");
        self.shared.abort_barrier();
        self.session.shutdown();
        self.discovery.close();
        self.close_capabilities();
        self.settings.close();
        if let Some(pinger) = &self.ping {
            pinger.close();
        }
        self.shared.router.close_all();
        self.shared.transport.close();
        self.join_dispatcher();
        let snapshot = self.shared.metrics.snapshot();
        self.shared.metrics.seal();
        info!(
            target: HOST_TARGET,
            data_received = snapshot.data_received,
            data_unrouted = snapshot.data_unrouted,
            commands_sent = snapshot.commands_sent,
            discovery_attempts = snapshot.discovery_attempts,
            dispatch_time_us = snapshot.dispatch_time_us,
            uptime_ms = snapshot.uptime_ms,
            "host metrics"
        );
        self.shared.health.closed();
    }

    fn close_capabilities(&self) {
        for capability in self.capabilities() {
            capability.close();
        }
    }

    fn join_dispatcher(&self) {
        let handle = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(dispatcher) = handle else {
            return;
        };
        if dispatcher.thread().id() == thread::current().id() {
            return;
        }
        if dispatcher.join().is_err() {
            warn!(target: HOST_TARGET, "dispatcher thread panicked");
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}

fn arm_first_sample(capability: &Capability, barrier: &Arc<StartupBarrier>) {
    let data_kind = capability.descriptor().data_kind.clone();
    let address = capability.descriptor().address.clone();
    let counted = Arc::new(AtomicBool::new(false));
    let arrival = Arc::clone(barrier);
    let callback_counted = Arc::clone(&counted);
    let callback_kind = data_kind.clone();
    let subscription = capability.device().add_callback(
        move |data| {
            if data.data_type != callback_kind {
                return Flow::Continue;
            }
            if !callback_counted.swap(true, Ordering::SeqCst) {
                debug!(
                    target: HOST_TARGET,
                    address = %address,
                    data_type = %callback_kind,
                    "first sample received"
                );
                arrival.arrive();
            }
            Flow::StopAndFinish
        },
        || {},
    );
    // A sample routed before the subscription existed is already cached.
    if capability.device().latest(&data_kind).is_some() && !counted.swap(true, Ordering::SeqCst) {
        debug!(
            target: HOST_TARGET,
            address = %capability.descriptor().address,
            data_type = %data_kind,
            "first sample already cached"
        );
        subscription.cancel();
        barrier.arrive();
    }
}

fn run_dispatcher(shared: &Shared) {
    debug!(target: HOST_TARGET, "dispatcher running");
    loop {
        match shared.transport.receive(DISPATCH_WAIT) {
            Received::Data(data) => shared.dispatch(&data),
            Received::Timeout => {
                if shared.is_closed() {
                    break;
                }
            }
            Received::Closed => {
                shared.transport_lost();
                break;
            }
        }
    }
    debug!(target: HOST_TARGET, "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::capability::CapabilityDescriptor;
    use crate::device::MockCommandSink;

    #[fixture]
    fn arm_stream() -> Capability {
        let mut sink = MockCommandSink::new();
        sink.expect_send().return_const(());
        Capability::build(
            CapabilityDescriptor::new(
                Address::singleton("arm"),
                InterfaceType::Publish,
                "joint-state",
            ),
            Arc::new(sink),
            CapabilityTimings {
                untagged_resend: Duration::from_millis(50),
                key_value_retry: Duration::from_millis(50),
            },
        )
    }

    fn joint_state() -> Data {
        Data::new(Address::singleton("arm"), "joint-state")
    }

    #[rstest]
    fn sample_cached_before_arming_counts_once(arm_stream: Capability) {
        arm_stream.device().deliver(&joint_state());
        let barrier = Arc::new(StartupBarrier::new(1));
        arm_first_sample(&arm_stream, &barrier);
        assert_eq!(barrier.arrived(), 1);
        arm_stream.device().deliver(&joint_state());
        assert_eq!(barrier.arrived(), 1);
        assert_eq!(barrier.wait_timeout(Duration::from_millis(10)), BarrierOutcome::Complete);
    }

    #[rstest]
    fn sample_after_arming_counts_once(arm_stream: Capability) {
        let barrier = Arc::new(StartupBarrier::new(1));
        arm_first_sample(&arm_stream, &barrier);
        assert_eq!(barrier.arrived(), 0);
        arm_stream.device().deliver(&Data::new(Address::singleton("arm"), "other"));
        assert_eq!(barrier.arrived(), 0);
        arm_stream.device().deliver(&joint_state());
        arm_stream.device().deliver(&joint_state());
        assert_eq!(barrier.arrived(), 1);
    }
}
