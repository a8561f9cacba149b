//! Control-session state machine.
//!
//! The host decides who holds the control session; this module only states
//! intent and observes the outcome. The state is derived from
//! `session-manager`/`connected-clients` data and published through a
//! fan-out so callers can wait for a particular state.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use strum::Display;
use tracing::{debug, info, warn};

use tether_wire::{Address, Command, ConnectedClients, Data};

use crate::device::{CommandSink, Device};
use crate::fanout::{Fanout, Flow, Subscription};

const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

/// `deviceType` of the session manager.
pub const SESSION_MANAGER: &str = "session-manager";
pub(crate) const CONNECTED_CLIENTS: &str = "connected-clients";
const CONNECTED_CLIENTS_REQUEST: &str = "connected-clients-request";
const OPERATOR: &str = "operator";
const SESSION_INFO: &str = "session-info";

/// Control-session state of this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    /// Not yet known.
    Unknown,
    /// Another client holds the session and cannot be evicted.
    Blocked,
    /// This client could take the session from a later client.
    Evictable,
    /// Nobody holds the session.
    Inactive,
    /// This client holds the session.
    Active,
    /// The host is closed.
    Shutdown,
    /// Offline playback; no session exists.
    Playback,
}

impl SessionState {
    /// Returns `true` for states that derivation never leaves.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Shutdown | Self::Playback)
    }
}

/// Derives this client's state from a connected-clients listing.
///
/// The first client flagged current and the first client holding an active
/// session are compared by position.
#[must_use]
pub fn derive_state(listing: &ConnectedClients) -> SessionState {
    let current = listing.clients.iter().position(|client| client.is_current);
    let session = listing
        .clients
        .iter()
        .position(|client| client.control_session_active);
    match (current, session) {
        (None, _) => SessionState::Unknown,
        (Some(_), None) => SessionState::Inactive,
        (Some(mine), Some(active)) if active < mine => SessionState::Blocked,
        (Some(mine), Some(active)) if active > mine => SessionState::Evictable,
        (Some(_), Some(_)) => SessionState::Active,
    }
}

#[derive(Debug)]
struct Intent {
    state: SessionState,
    take_control: bool,
    release_control: bool,
    last_query: Option<Instant>,
    last_take: Option<Instant>,
    last_release: Option<Instant>,
}

impl Intent {
    fn due(last: Option<Instant>, retry: Duration) -> bool {
        last.is_none_or(|sent| sent.elapsed() > retry)
    }

    /// Picks the request to send now, if any, and records it.
    fn next_request(&mut self, retry: Duration) -> Option<Command> {
        match self.state {
            SessionState::Unknown if Self::due(self.last_query, retry) => {
                self.last_query = Some(Instant::now());
                Some(Command::new(
                    Address::singleton(SESSION_MANAGER),
                    CONNECTED_CLIENTS_REQUEST,
                ))
            }
            SessionState::Evictable | SessionState::Inactive
                if self.take_control && Self::due(self.last_take, retry) =>
            {
                self.last_take = Some(Instant::now());
                Some(session_info(OPERATOR))
            }
            SessionState::Active
                if !self.take_control
                    && self.release_control
                    && Self::due(self.last_release, retry) =>
            {
                self.last_release = Some(Instant::now());
                Some(session_info(SESSION_INFO))
            }
            _ => None,
        }
    }
}

fn session_info(device_type: &str) -> Command {
    Command::new(Address::singleton(device_type), SESSION_INFO)
        .with_field("sessionInfo", Value::Object(Map::new()))
}

/// Owns the session state and the requests that move it.
#[derive(Debug)]
pub struct SessionManager {
    device: Arc<Device>,
    intent: Arc<Mutex<Intent>>,
    updates: Fanout<SessionState>,
    retry: Duration,
}

impl SessionManager {
    /// Creates a live manager in [`SessionState::Unknown`].
    #[must_use]
    pub fn new(sink: Arc<dyn CommandSink>, take_control: bool, retry: Duration) -> Self {
        Self::with_state(sink, SessionState::Unknown, take_control, retry)
    }

    /// Creates a manager fixed in [`SessionState::Playback`].
    #[must_use]
    pub fn playback(sink: Arc<dyn CommandSink>) -> Self {
        Self::with_state(sink, SessionState::Playback, false, Duration::MAX)
    }

    fn with_state(
        sink: Arc<dyn CommandSink>,
        state: SessionState,
        take_control: bool,
        retry: Duration,
    ) -> Self {
        let device = Arc::new(Device::new(Address::singleton(SESSION_MANAGER), sink));
        let intent = Arc::new(Mutex::new(Intent {
            state,
            take_control,
            release_control: false,
            last_query: None,
            last_take: None,
            last_release: None,
        }));
        let updates = Fanout::new();
        let observed = Arc::clone(&intent);
        let publish = updates.clone();
        let requests: Weak<Device> = Arc::downgrade(&device);
        device.subscribe(move |data| {
            observe(&observed, &publish, &requests, data, retry);
        });
        Self {
            device,
            intent,
            updates,
            retry,
        }
    }

    /// Underlying device.
    #[must_use]
    pub const fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Starts the periodic request poll.
    pub fn start(&self, period: Duration) {
        if self.state().is_final() {
            return;
        }
        let intent = Arc::clone(&self.intent);
        let device: Weak<Device> = Arc::downgrade(&self.device);
        let retry = self.retry;
        self.device.poll(period, move || {
            let Some(live) = device.upgrade() else {
                return Flow::StopAndFinish;
            };
            poll_once(&intent, &live, retry);
            Flow::Continue
        });
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Records whether this client wants control and polls immediately.
    ///
    /// Advisory only: the state changes when the host confirms it.
    pub fn set_should_take_control(&self, take_control: bool, release_control: bool) {
        {
            let mut intent = self.lock();
            if intent.take_control != take_control || intent.release_control != release_control {
                intent.last_take = None;
                intent.last_release = None;
            }
            intent.take_control = take_control;
            intent.release_control = release_control;
        }
        debug!(
            target: SESSION_TARGET,
            take_control,
            release_control,
            "session intent changed"
        );
        poll_once(&self.intent, &self.device, self.retry);
    }

    /// Blocks until `state` is observed or `timeout` elapses.
    #[must_use]
    pub fn wait_for_session_state(&self, state: SessionState, timeout: Duration) -> bool {
        let (sender, receiver) = mpsc::channel();
        let reached = sender.clone();
        let subscription = self.updates.add(
            move |current| {
                if *current != state {
                    return Flow::Continue;
                }
                if reached.send(true).is_err() {
                    debug!(target: SESSION_TARGET, "state reached after wait ended");
                }
                Flow::StopAndFinish
            },
            move || {
                if sender.send(false).is_err() {
                    debug!(target: SESSION_TARGET, "session wait already ended");
                }
            },
        );
        if self.state() == state {
            subscription.cancel();
            return true;
        }
        let outcome = match receiver.recv_timeout(timeout) {
            Ok(value) => value,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        };
        subscription.cancel();
        outcome || self.state() == state
    }

    /// Registers a subscriber for state changes.
    pub fn add_update_callback<C, F>(&self, callback: C, finished: F) -> Subscription
    where
        C: FnMut(&SessionState) -> Flow + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.updates.add(callback, finished)
    }

    /// Enters [`SessionState::Shutdown`], publishes it and closes.
    pub fn shutdown(&self) {
        {
            let mut intent = self.lock();
            if intent.state == SessionState::Shutdown {
                return;
            }
            intent.state = SessionState::Shutdown;
        }
        info!(target: SESSION_TARGET, state = %SessionState::Shutdown, "session shut down");
        self.updates.call(&SessionState::Shutdown);
        self.updates.close();
        self.device.close();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Intent> {
        self.intent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn poll_once(intent: &Mutex<Intent>, device: &Device, retry: Duration) {
    let request = intent
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_request(retry);
    if let Some(command) = request {
        debug!(
            target: SESSION_TARGET,
            device_type = %command.address.kind,
            data_type = %command.data_type,
            "sending session request"
        );
        device.send(command);
    }
}

fn observe(
    intent: &Mutex<Intent>,
    updates: &Fanout<SessionState>,
    device: &Weak<Device>,
    data: &Data,
    retry: Duration,
) {
    if data.data_type != CONNECTED_CLIENTS || !data.address.name.is_empty() {
        return;
    }
    let listing = match data.connected_clients() {
        Ok(listing) => listing,
        Err(error) => {
            warn!(target: SESSION_TARGET, error = %error, "malformed connected clients");
            return;
        }
    };
    let derived = derive_state(&listing);
    let changed = {
        let mut guard = intent.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.state.is_final() || guard.state == derived {
            None
        } else {
            let previous = guard.state;
            guard.state = derived;
            Some(previous)
        }
    };
    if let Some(live) = device.upgrade() {
        poll_once(intent, &live, retry);
    }
    if let Some(previous) = changed {
        info!(
            target: SESSION_TARGET,
            from = %previous,
            to = %derived,
            "session state changed"
        );
        updates.call(&derived);
    }
}
