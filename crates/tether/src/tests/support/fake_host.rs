//! Scripted robot-control host listening on a loopback socket.
//!
//! Answers discovery, session, key-value, ping and frame requests from a
//! [`Script`], publishes pushed streams once discovery has been answered and
//! records every command it receives.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use tether_wire::{
    Address, Command, ConnectedClient, Data, FRAME_REQUEST, KEY_VALUE, KEY_VALUE_REQUEST,
    MachineInterfaceEntry, decode_command, encode_data, now_seconds,
};

use crate::discovery::{DISCOVERY_AGGREGATOR, MACHINE_INTERFACES, MACHINE_INTERFACES_REQUEST};
use crate::ping::PING;
use crate::session::SESSION_MANAGER;

const PUBLISH_PERIOD: Duration = Duration::from_millis(20);

/// What the fake host knows and how it answers.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub interfaces: Vec<MachineInterfaceEntry>,
    /// Streams published unsolicited once discovery is answered.
    pub pushed: Vec<(Address, String)>,
    /// Streams answered only on `frame-request`.
    pub framed: Vec<(Address, String)>,
    pub clients: Vec<ConnectedClient>,
    pub settings: Vec<(String, String)>,
    /// Discovery requests dropped before the first answer.
    pub ignored_discovery: usize,
}

impl Script {
    pub fn interface(
        mut self,
        interface: &str,
        device_type: &str,
        device_name: &str,
        data_type: &str,
    ) -> Self {
        self.interfaces.push(MachineInterfaceEntry {
            interface_type: interface.to_owned(),
            device_type: device_type.to_owned(),
            device_name: device_name.to_owned(),
            data_type: data_type.to_owned(),
            keys: Vec::new(),
        });
        self
    }

    pub fn push_stream(mut self, address: Address, data_type: &str) -> Self {
        self.pushed.push((address, data_type.to_owned()));
        self
    }

    pub fn frame_stream(mut self, address: Address, data_type: &str) -> Self {
        self.framed.push((address, data_type.to_owned()));
        self
    }

    pub fn client(mut self, uid: &str, is_current: bool, active: bool) -> Self {
        self.clients.push(ConnectedClient {
            uid: uid.to_owned(),
            is_current,
            control_session_active: active,
        });
        self
    }

    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.push((key.to_owned(), value.to_owned()));
        self
    }
}

struct HostState {
    script: Script,
    clients: Mutex<Vec<ConnectedClient>>,
    commands: Mutex<Vec<Command>>,
    writer: Mutex<Option<TcpStream>>,
    discovery_requests: AtomicUsize,
    publishing: AtomicBool,
    stopped: AtomicBool,
    next_seq: AtomicU64,
}

impl HostState {
    fn write(&self, data: &Data) {
        let bytes = encode_data(data).expect("encode fake host data");
        let mut writer = self.writer.lock().expect("fake host writer lock");
        if let Some(stream) = writer.as_mut() {
            if stream.write_all(&bytes).is_err() {
                *writer = None;
            }
        }
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn sample(&self, address: &Address, data_type: &str) -> Data {
        Data::new(address.clone(), data_type)
            .with_seq(self.seq())
            .with_ts(now_seconds())
    }

    fn answer(&self, command: &Command) {
        let kind = command.address.kind.as_str();
        match command.data_type.as_str() {
            MACHINE_INTERFACES_REQUEST if kind == DISCOVERY_AGGREGATOR => {
                self.answer_discovery(command);
            }
            "connected-clients-request" if kind == SESSION_MANAGER => self.publish_clients(),
            "session-info" => self.change_session(kind == "operator"),
            KEY_VALUE_REQUEST => self.answer_key(command),
            PING => {
                let mut reply = Data::new(command.address.clone(), PING);
                reply.tag.clone_from(&command.tag);
                self.write(&reply);
            }
            FRAME_REQUEST => {
                let stream = self
                    .script
                    .framed
                    .iter()
                    .find(|(address, _)| *address == command.address);
                if let Some((address, data_type)) = stream {
                    let mut reply = self.sample(address, data_type);
                    reply.tag.clone_from(&command.tag);
                    self.write(&reply);
                }
            }
            _ => {}
        }
    }

    fn answer_discovery(&self, command: &Command) {
        let seen = self.discovery_requests.fetch_add(1, Ordering::SeqCst);
        if seen < self.script.ignored_discovery {
            return;
        }
        let mut reply = Data::new(Address::singleton(DISCOVERY_AGGREGATOR), MACHINE_INTERFACES)
            .with_ts(now_seconds())
            .with_field("machineInterfaces", json!(self.script.interfaces));
        reply.tag.clone_from(&command.tag);
        self.write(&reply);
        self.publishing.store(true, Ordering::SeqCst);
    }

    fn publish_clients(&self) {
        let clients = self.clients.lock().expect("fake host clients lock").clone();
        self.write(
            &Data::new(Address::singleton(SESSION_MANAGER), "connected-clients")
                .with_field("connectedClients", json!({ "clients": clients })),
        );
    }

    fn change_session(&self, take: bool) {
        {
            let mut clients = self.clients.lock().expect("fake host clients lock");
            let current = clients.iter().position(|client| client.is_current);
            let holder = clients.iter().position(|client| client.control_session_active);
            let blocked = matches!((current, holder), (Some(mine), Some(held)) if held < mine);
            for client in clients.iter_mut() {
                if take && !blocked {
                    client.control_session_active = client.is_current;
                } else if !take && client.is_current {
                    client.control_session_active = false;
                }
            }
        }
        self.publish_clients();
    }

    fn answer_key(&self, command: &Command) {
        let Some(key) = command.key.as_deref() else {
            return;
        };
        let Some((_, value)) = self.script.settings.iter().find(|(name, _)| name == key) else {
            return;
        };
        let mut reply = Data::new(command.address.clone(), KEY_VALUE)
            .with_key(key)
            .with_field("value", json!(value));
        reply.tag.clone_from(&command.tag);
        self.write(&reply);
    }
}

/// Loopback host driven by a [`Script`].
pub struct FakeHost {
    address: SocketAddr,
    state: Arc<HostState>,
    workers: Vec<JoinHandle<()>>,
}

impl FakeHost {
    pub fn start(script: Script) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fake host");
        let address = listener.local_addr().expect("fake host address");
        let state = Arc::new(HostState {
            clients: Mutex::new(script.clients.clone()),
            script,
            commands: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            discovery_requests: AtomicUsize::new(0),
            publishing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
        });
        let serving = Arc::clone(&state);
        let server = thread::spawn(move || serve(&listener, &serving));
        let publishing = Arc::clone(&state);
        let publisher = thread::spawn(move || publish(&publishing));
        Self {
            address,
            state,
            workers: vec![server, publisher],
        }
    }

    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.commands.lock().expect("fake host commands lock").clone()
    }

    pub fn count(&self, address: &Address, data_type: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.address == *address && command.data_type == data_type)
            .count()
    }

    pub fn discovery_requests(&self) -> usize {
        self.state.discovery_requests.load(Ordering::SeqCst)
    }

    /// Drops the connection so the client sees end of stream.
    pub fn disconnect(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        let writer = self.state.writer.lock().expect("fake host writer lock").take();
        if let Some(stream) = writer {
            let _ignored = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        let accepted = self.state.writer.lock().expect("fake host writer lock").is_some();
        self.disconnect();
        if !accepted {
            let _unblock = TcpStream::connect(self.address);
        }
        for worker in self.workers.drain(..) {
            let _ignored = worker.join();
        }
    }
}

fn serve(listener: &TcpListener, state: &HostState) {
    let Ok((stream, _)) = listener.accept() else {
        return;
    };
    if state.stopped.load(Ordering::SeqCst) {
        return;
    }
    let Ok(writer) = stream.try_clone() else {
        return;
    };
    *state.writer.lock().expect("fake host writer lock") = Some(writer);
    for line in BufReader::new(stream).lines() {
        let Ok(text) = line else {
            break;
        };
        let Ok(command) = decode_command(&text) else {
            continue;
        };
        state
            .commands
            .lock()
            .expect("fake host commands lock")
            .push(command.clone());
        state.answer(&command);
    }
}

fn publish(state: &HostState) {
    while !state.stopped.load(Ordering::SeqCst) {
        thread::sleep(PUBLISH_PERIOD);
        if !state.publishing.load(Ordering::SeqCst) {
            continue;
        }
        for (address, data_type) in &state.script.pushed {
            let sample = state.sample(address, data_type);
            state.write(&sample);
        }
    }
}
