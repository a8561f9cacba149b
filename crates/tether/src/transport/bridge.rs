//! Transport through an external connector tool.
//!
//! The tool is spawned with piped stdout and stderr. Its first stdout line
//! must announce a data server (`{"msg-type":"device-data-server", ...}`);
//! the transport then connects a [`SocketTransport`] to the announced address.
//! Later stdout lines and all of stderr are drained to the log so the child
//! never blocks on a full pipe.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use tether_config::Timings;
use tether_wire::{BridgeHandshake, Command};

use super::{BridgeError, Received, SocketTransport, TRANSPORT_TARGET, Transport};

const EXIT_POLL: Duration = Duration::from_millis(50);
const ESCALATION: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL];

/// Socket transport backed by a supervised connector process.
#[derive(Debug)]
pub struct BridgeTransport {
    program: Utf8PathBuf,
    child: Mutex<Option<Child>>,
    socket: SocketTransport,
    grace: Duration,
}

impl BridgeTransport {
    /// Spawns `program`, waits for its handshake and connects.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] when the tool cannot be started, does not
    /// announce a data server in time, announces something else, or the
    /// announced server refuses the connection. The child is stopped in
    /// every error case.
    pub fn spawn(
        program: &Utf8Path,
        args: &[String],
        timings: &Timings,
    ) -> Result<Self, BridgeError> {
        debug!(
            target: TRANSPORT_TARGET,
            program = %program,
            args = ?args,
            "spawning bridge tool"
        );
        let mut child = ProcessCommand::new(program.as_std_path())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        let grace = timings.bridge_signal_grace();
        match handshake(program, &mut child, timings) {
            Ok(socket) => {
                info!(
                    target: TRANSPORT_TARGET,
                    program = %program,
                    pid = child.id(),
                    peer = %socket.peer(),
                    "bridge connected"
                );
                Ok(Self {
                    program: program.to_owned(),
                    child: Mutex::new(Some(child)),
                    socket,
                    grace,
                })
            }
            Err(failure) => {
                terminate(program, &mut child, grace);
                Err(failure)
            }
        }
    }

    /// Process id of the connector tool while it is supervised.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Child::id)
    }
}

impl Transport for BridgeTransport {
    fn send(&self, command: Command) {
        self.socket.send(command);
    }

    fn receive(&self, timeout: Duration) -> Received {
        self.socket.receive(timeout)
    }

    fn drain(&self) -> usize {
        self.socket.drain()
    }

    fn close(&self) {
        self.socket.close();
        let taken = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut child) = taken {
            terminate(&self.program, &mut child, self.grace);
        }
    }

    fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn handshake(
    program: &Utf8Path,
    child: &mut Child,
    timings: &Timings,
) -> Result<SocketTransport, BridgeError> {
    let stdout = child.stdout.take().ok_or_else(|| BridgeError::MissingPipe {
        program: program.to_owned(),
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or_else(|| BridgeError::MissingPipe {
        program: program.to_owned(),
        stream: "stderr",
    })?;
    drain_stderr(program, stderr);

    let (first_tx, first_rx) = mpsc::channel();
    let name = program.to_string();
    let reader = thread::Builder::new()
        .name("tether-bridge-stdout".to_owned())
        .spawn(move || {
            let mut lines = BufReader::new(stdout).lines();
            let first = lines.next().and_then(Result::ok);
            if first_tx.send(first).is_err() {
                debug!(target: TRANSPORT_TARGET, program = %name, "handshake wait ended");
            }
            for line in lines.map_while(Result::ok) {
                debug!(target: TRANSPORT_TARGET, program = %name, stdout = %line, "bridge output");
            }
        });
    if let Err(source) = reader {
        return Err(BridgeError::Spawn {
            program: program.to_owned(),
            source,
        });
    }

    let timeout = timings.bridge_handshake_timeout();
    let line = match first_rx.recv_timeout(timeout) {
        Ok(Some(line)) => line,
        Ok(None) | Err(RecvTimeoutError::Disconnected) => {
            return Err(BridgeError::HandshakeEof {
                program: program.to_owned(),
            });
        }
        Err(RecvTimeoutError::Timeout) => {
            return Err(BridgeError::HandshakeTimeout {
                program: program.to_owned(),
                timeout,
            });
        }
    };
    let announced = BridgeHandshake::parse(&line).map_err(|source| BridgeError::Handshake {
        program: program.to_owned(),
        source,
    })?;
    debug!(
        target: TRANSPORT_TARGET,
        host = %announced.hostname,
        port = announced.port,
        "bridge announced data server"
    );
    Ok(SocketTransport::connect(
        &announced.hostname,
        announced.port,
        timings,
    )?)
}

fn drain_stderr(program: &Utf8Path, stderr: impl Read + Send + 'static) {
    let name = program.to_string();
    let spawned = thread::Builder::new()
        .name("tether-bridge-stderr".to_owned())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                info!(target: TRANSPORT_TARGET, program = %name, stderr = %line, "bridge stderr");
            }
        });
    if let Err(spawn_error) = spawned {
        warn!(
            target: TRANSPORT_TARGET,
            program = %program,
            error = %spawn_error,
            "failed to drain bridge stderr"
        );
    }
}

/// Escalates SIGINT, SIGTERM, SIGKILL, waiting `grace` after each.
fn terminate(program: &Utf8Path, child: &mut Child, grace: Duration) {
    if wait_for_exit(child, Duration::ZERO) {
        return;
    }
    let Some(pid) = i32::try_from(child.id()).ok().map(Pid::from_raw) else {
        warn!(target: TRANSPORT_TARGET, program = %program, "bridge pid out of range");
        return;
    };
    for signal in ESCALATION {
        match kill(pid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                drop(child.try_wait());
                return;
            }
            Err(errno) => warn!(
                target: TRANSPORT_TARGET,
                program = %program,
                signal = %signal,
                error = %errno,
                "failed to signal bridge tool"
            ),
        }
        if wait_for_exit(child, grace) {
            debug!(
                target: TRANSPORT_TARGET,
                program = %program,
                signal = %signal,
                "bridge tool stopped"
            );
            return;
        }
    }
    error!(
        target: TRANSPORT_TARGET,
        program = %program,
        pid = child.id(),
        "bridge tool survived SIGKILL"
    );
}

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(wait_error) => {
                debug!(target: TRANSPORT_TARGET, error = %wait_error, "bridge wait failed");
                return false;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL.min(deadline - now));
    }
}
