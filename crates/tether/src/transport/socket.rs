//! Direct TCP transport.
//!
//! Four threads serve one connection:
//!
//! * `tether-pulse` beats the shared [`Heartbeat`] while the handle lives.
//! * `tether-serializer` encodes queued commands into lines.
//! * `tether-writer` owns the write half and drains encoded lines.
//! * `tether-reader` owns the read half and decodes lines into the queue.
//!
//! The serializer and reader are supervised: if the heartbeat is older than
//! the configured timeout they stop on their own and fire the close trigger.
//! The trigger shuts the socket down in both directions, which unblocks every
//! other worker, and the reader raises the queue's close sentinel on exit.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use tether_config::Timings;
use tether_wire::{Command, WireError, decode_line, encode_line};

use super::{Heartbeat, InboundQueue, Received, TRANSPORT_TARGET, Transport, TransportError};
use crate::poll::StopSignal;

#[derive(Debug, Clone, Copy)]
struct Supervision {
    interval: Duration,
    timeout: Duration,
}

/// Shuts the socket down once, whoever notices the fault first.
#[derive(Debug)]
struct CloseTrigger {
    fired: AtomicBool,
    stream: TcpStream,
}

impl CloseTrigger {
    fn fire(&self, reason: &'static str) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(target: TRANSPORT_TARGET, reason, "closing socket");
        if let Err(error) = self.stream.shutdown(Shutdown::Both) {
            trace!(target: TRANSPORT_TARGET, error = %error, "socket already shut down");
        }
        true
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Transport over a TCP connection to the host.
#[derive(Debug)]
pub struct SocketTransport {
    peer: SocketAddr,
    queue: Arc<InboundQueue>,
    commands: Mutex<Option<Sender<Command>>>,
    trigger: Arc<CloseTrigger>,
    pulse: Arc<StopSignal>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Resolves `host:port` and connects.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when resolution, connection, socket
    /// configuration or worker start-up fails.
    pub fn connect(host: &str, port: u16, timings: &Timings) -> Result<Self, TransportError> {
        let addr = resolve(host, port)?;
        Self::connect_addr(addr, timings)
    }

    /// Connects to an already resolved address.
    ///
    /// # Errors
    ///
    /// Same as [`SocketTransport::connect`], minus resolution.
    pub fn connect_addr(addr: SocketAddr, timings: &Timings) -> Result<Self, TransportError> {
        let stream = open_stream(addr, timings)?;
        Self::start(addr, stream, timings)
    }

    fn start(
        peer: SocketAddr,
        stream: TcpStream,
        timings: &Timings,
    ) -> Result<Self, TransportError> {
        let supervision = Supervision {
            interval: timings.heartbeat_interval(),
            timeout: timings.heartbeat_timeout(),
        };
        let read_half = stream.try_clone().map_err(option_error("try_clone"))?;
        let write_half = stream.try_clone().map_err(option_error("try_clone"))?;
        let trigger = Arc::new(CloseTrigger {
            fired: AtomicBool::new(false),
            stream,
        });
        let queue = Arc::new(InboundQueue::new());
        let heartbeat = Arc::new(Heartbeat::new());
        let pulse = Arc::new(StopSignal::new());
        let (command_tx, command_rx) = mpsc::channel();

        let spawned = spawn_workers(Workers {
            read_half,
            write_half,
            commands: command_rx,
            queue: Arc::clone(&queue),
            heartbeat,
            pulse: Arc::clone(&pulse),
            trigger: Arc::clone(&trigger),
            supervision,
        });
        let workers = match spawned {
            Ok(workers) => workers,
            Err(error) => {
                trigger.fire("worker start-up failed");
                pulse.stop();
                queue.close();
                return Err(error);
            }
        };
        info!(target: TRANSPORT_TARGET, peer = %peer, "socket transport connected");
        Ok(Self {
            peer,
            queue,
            commands: Mutex::new(Some(command_tx)),
            trigger,
            pulse,
            workers: Mutex::new(workers),
        })
    }

    /// Address of the connected host.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Inbound queue, for close-sentinel assertions.
    #[cfg(test)]
    pub(crate) fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    /// Stops beating the heartbeat as if the owner had died.
    #[cfg(test)]
    pub(crate) fn stop_heartbeat(&self) {
        self.pulse.stop();
    }
}

impl Transport for SocketTransport {
    fn send(&self, command: Command) {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = commands.as_ref() else {
            debug!(
                target: TRANSPORT_TARGET,
                data_type = %command.data_type,
                "dropping command after close"
            );
            return;
        };
        if sender.send(command).is_err() {
            debug!(target: TRANSPORT_TARGET, "serializer gone, dropping command");
        }
    }

    fn receive(&self, timeout: Duration) -> Received {
        self.queue.receive(timeout)
    }

    fn drain(&self) -> usize {
        self.queue.drain()
    }

    fn close(&self) {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(commands) = sender else {
            return;
        };
        drop(commands);
        self.trigger.fire("close requested");
        self.pulse.stop();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("transport").to_owned();
            if handle.join().is_err() {
                let error = TransportError::ThreadPanic { name };
                warn!(target: TRANSPORT_TARGET, error = %error, "transport worker failed");
            }
        }
        self.queue.close();
        info!(target: TRANSPORT_TARGET, peer = %self.peer, "socket transport closed");
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.pulse.stop();
    }
}

struct Workers {
    read_half: TcpStream,
    write_half: TcpStream,
    commands: Receiver<Command>,
    queue: Arc<InboundQueue>,
    heartbeat: Arc<Heartbeat>,
    pulse: Arc<StopSignal>,
    trigger: Arc<CloseTrigger>,
    supervision: Supervision,
}

fn spawn_workers(workers: Workers) -> Result<Vec<JoinHandle<()>>, TransportError> {
    let Workers {
        read_half,
        write_half,
        commands,
        queue,
        heartbeat,
        pulse,
        trigger,
        supervision,
    } = workers;
    let (line_tx, line_rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(4);

    let beating = Arc::clone(&heartbeat);
    handles.push(spawn_named("tether-pulse", move || {
        run_pulse(&beating, &pulse, supervision.interval);
    })?);

    let serializer_heartbeat = Arc::clone(&heartbeat);
    let serializer_trigger = Arc::clone(&trigger);
    handles.push(spawn_named("tether-serializer", move || {
        run_serializer(
            &commands,
            &line_tx,
            &serializer_heartbeat,
            &serializer_trigger,
            supervision,
        );
    })?);

    let writer_trigger = Arc::clone(&trigger);
    handles.push(spawn_named("tether-writer", move || {
        run_writer(write_half, &line_rx, &writer_trigger);
    })?);

    handles.push(spawn_named("tether-reader", move || {
        run_reader(read_half, &queue, &heartbeat, &trigger, supervision);
    })?);
    Ok(handles)
}

fn spawn_named<F>(name: &'static str, body: F) -> Result<JoinHandle<()>, TransportError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .map_err(|source| TransportError::Spawn {
            name,
            source: Arc::new(source),
        })
}

fn run_pulse(heartbeat: &Heartbeat, pulse: &StopSignal, interval: Duration) {
    loop {
        heartbeat.beat();
        if pulse.wait(interval) {
            break;
        }
    }
}

fn run_serializer(
    commands: &Receiver<Command>,
    lines: &Sender<Vec<u8>>,
    heartbeat: &Heartbeat,
    trigger: &CloseTrigger,
    supervision: Supervision,
) {
    while !trigger.is_fired() {
        if heartbeat.is_lost(supervision.timeout) {
            warn!(
                target: TRANSPORT_TARGET,
                unit = "serializer",
                age = ?heartbeat.age(),
                "heartbeat lost"
            );
            break;
        }
        match commands.recv_timeout(supervision.interval) {
            Ok(command) => match encode_line(&command) {
                Ok(line) => {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(
                    target: TRANSPORT_TARGET,
                    data_type = %command.data_type,
                    error = %error,
                    "dropping unencodable command"
                ),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trigger.fire("serializer stopped");
}

fn run_writer(mut stream: TcpStream, lines: &Receiver<Vec<u8>>, trigger: &CloseTrigger) {
    for line in lines {
        if let Err(error) = stream.write_all(&line).and_then(|()| stream.flush()) {
            if !trigger.is_fired() {
                warn!(target: TRANSPORT_TARGET, error = %error, "socket write failed");
            }
            trigger.fire("write failed");
            break;
        }
    }
}

fn run_reader(
    stream: TcpStream,
    queue: &InboundQueue,
    heartbeat: &Heartbeat,
    trigger: &CloseTrigger,
    supervision: Supervision,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    while !trigger.is_fired() {
        if heartbeat.is_lost(supervision.timeout) {
            warn!(
                target: TRANSPORT_TARGET,
                unit = "reader",
                age = ?heartbeat.age(),
                "heartbeat lost"
            );
            break;
        }
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                debug!(target: TRANSPORT_TARGET, "host closed the connection");
                break;
            }
            Ok(_) if line.ends_with(b"\n") => {
                enqueue_line(&line, queue);
                line.clear();
            }
            // EOF in the middle of a line; the next read reports it.
            Ok(_) => {}
            Err(error) if is_timeout(&error) => {}
            Err(error) => {
                if !trigger.is_fired() {
                    warn!(target: TRANSPORT_TARGET, error = %error, "socket read failed");
                }
                break;
            }
        }
    }
    trigger.fire("reader stopped");
    if queue.close() {
        debug!(target: TRANSPORT_TARGET, "close sentinel queued");
    }
}

fn enqueue_line(raw: &[u8], queue: &InboundQueue) {
    let text = String::from_utf8_lossy(raw);
    match decode_line(&text) {
        Ok(data) => {
            if !queue.push(data) {
                trace!(target: TRANSPORT_TARGET, "dropping data after close");
            }
        }
        Err(WireError::Empty) => {}
        Err(error) => warn!(
            target: TRANSPORT_TARGET,
            error = %error,
            "skipping malformed line"
        ),
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: host.to_owned(),
            port,
            source: Arc::new(source),
        })?;
    addrs.next().ok_or_else(|| TransportError::ResolveEmpty {
        host: host.to_owned(),
        port,
    })
}

fn open_stream(addr: SocketAddr, timings: &Timings) -> Result<TcpStream, TransportError> {
    let connect_error = |source: io::Error| TransportError::Connect {
        addr,
        source: Arc::new(source),
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(connect_error)?;
    socket
        .set_reuse_address(true)
        .map_err(option_error("SO_REUSEADDR"))?;
    socket
        .connect_timeout(&SockAddr::from(addr), timings.connect_timeout())
        .map_err(connect_error)?;
    let stream: TcpStream = socket.into();
    stream
        .set_nodelay(true)
        .map_err(option_error("TCP_NODELAY"))?;
    let read_timeout = Some(timings.read_timeout()).filter(|timeout| !timeout.is_zero());
    stream
        .set_read_timeout(read_timeout)
        .map_err(option_error("SO_RCVTIMEO"))?;
    Ok(stream)
}

fn option_error(option: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::SocketOption {
        option,
        source: Arc::new(source),
    }
}
