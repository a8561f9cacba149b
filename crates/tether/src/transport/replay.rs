//! Offline playback of a recorded log.
//!
//! A log directory holds `device-data/00000.json`, `00001.json`, ... in
//! recording order, each file a series of newline-delimited [`Data`]. An
//! optional `command-data/` directory holds the commands the host received,
//! numbered the same way. Loading stops at the first missing index. Nothing
//! advances on its own: records reach the receive queue only through
//! [`ReplayTransport::step`] and the two seek operations.

use std::fs;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use tracing::{debug, info, trace, warn};

use tether_config::ReplayClient;
use tether_wire::{Command, Data, WireError, decode_command, decode_line};

use super::simulator::{ClientSimulator, without_current_client};
use super::{InboundQueue, Received, ReplayError, TRANSPORT_TARGET, Transport};
use crate::discovery::MACHINE_INTERFACES;

const DEVICE_DATA: &str = "device-data";
const COMMAND_DATA: &str = "command-data";

/// Recorded inbound messages in recording order, with the commands the host
/// received while recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayLog {
    records: Vec<Data>,
    commands: Vec<Command>,
}

impl ReplayLog {
    /// Wraps already decoded records.
    #[must_use]
    pub const fn from_records(records: Vec<Data>) -> Self {
        Self {
            records,
            commands: Vec::new(),
        }
    }

    /// Attaches recorded commands.
    #[must_use]
    pub fn with_commands(mut self, commands: Vec<Command>) -> Self {
        self.commands = commands;
        self
    }

    /// Loads every numbered file under `directory/device-data` and, when
    /// present, `directory/command-data`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::MissingDirectory`] when the device data
    /// directory does not exist and [`ReplayError::Read`] when a present file
    /// cannot be read.
    pub fn load_directory(directory: &Utf8Path) -> Result<Self, ReplayError> {
        let data_dir = directory.join(DEVICE_DATA);
        if !data_dir.is_dir() {
            return Err(ReplayError::MissingDirectory { path: data_dir });
        }
        let records = read_numbered(&data_dir, decode_line)?;
        let command_dir = directory.join(COMMAND_DATA);
        let commands = if command_dir.is_dir() {
            read_numbered(&command_dir, decode_command)?
        } else {
            Vec::new()
        };
        info!(
            target: TRANSPORT_TARGET,
            directory = %directory,
            records = records.len(),
            commands = commands.len(),
            "replay log loaded"
        );
        Ok(Self { records, commands })
    }

    /// Every record.
    #[must_use]
    pub fn records(&self) -> &[Data] {
        &self.records
    }

    /// Every recorded command.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when the log holds nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First recorded capability catalogue.
    #[must_use]
    pub fn catalogue_record(&self) -> Option<&Data> {
        self.records
            .iter()
            .find(|record| record.data_type == MACHINE_INTERFACES)
    }
}

fn position_of_sequence(records: &[Data], sequence: u64) -> Option<usize> {
    records
        .iter()
        .position(|record| record.seq == Some(sequence))
        .or_else(|| {
            records
                .iter()
                .position(|record| record.seq.is_some_and(|seq| seq >= sequence))
        })
}

fn position_of_timestamp(records: &[Data], timestamp: f64) -> Option<usize> {
    records
        .iter()
        .position(|record| record.ts.is_some_and(|ts| ts >= timestamp))
}

fn read_numbered<T>(
    dir: &Utf8Path,
    decode: fn(&str) -> Result<T, WireError>,
) -> Result<Vec<T>, ReplayError> {
    let mut items = Vec::new();
    for index in 0_u32.. {
        let path = dir.join(format!("{index:05}.json"));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => break,
            Err(source) => return Err(ReplayError::Read { path, source }),
        };
        read_lines(&path, &text, decode, &mut items);
    }
    Ok(items)
}

fn read_lines<T>(
    path: &Utf8Path,
    text: &str,
    decode: fn(&str) -> Result<T, WireError>,
    items: &mut Vec<T>,
) {
    for (line_number, line) in text.lines().enumerate() {
        match decode(line) {
            Ok(item) => items.push(item),
            Err(WireError::Empty) => {}
            Err(error) => warn!(
                target: TRANSPORT_TARGET,
                path = %path,
                line = line_number.saturating_add(1),
                error = %error,
                "skipping malformed replay record"
            ),
        }
    }
}

/// Transport that hands out recorded messages on demand.
///
/// Without a simulated client every record is visible and no client in a
/// `connected-clients` listing is marked current. With one, only what the
/// host delivered to that client is visible.
#[derive(Debug)]
pub struct ReplayTransport {
    log: ReplayLog,
    visible: Vec<Data>,
    simulator: Option<ClientSimulator>,
    cursor: Mutex<usize>,
    queue: InboundQueue,
}

impl ReplayTransport {
    /// Positions a new transport at the start of `log`.
    #[must_use]
    pub fn new(log: ReplayLog) -> Self {
        let visible = log.records.iter().map(without_current_client).collect();
        Self::with_visible(log, visible, None)
    }

    /// Positions a new transport at the start of `log` as seen by one
    /// recorded client.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::ClientNotFound`] when the log never lists a
    /// matching client.
    pub fn simulating(log: ReplayLog, client: &ReplayClient) -> Result<Self, ReplayError> {
        let simulator = ClientSimulator::new(client, &log.records, &log.commands)?;
        let visible: Vec<Data> = log
            .records
            .iter()
            .filter_map(|record| simulator.transform(record))
            .collect();
        debug!(
            target: TRANSPORT_TARGET,
            client = simulator.client_id(),
            visible = visible.len(),
            recorded = log.len(),
            "replay filtered for client"
        );
        Ok(Self::with_visible(log, visible, Some(simulator)))
    }

    fn with_visible(log: ReplayLog, visible: Vec<Data>, simulator: Option<ClientSimulator>) -> Self {
        Self {
            log,
            visible,
            simulator,
            cursor: Mutex::new(0),
            queue: InboundQueue::new(),
        }
    }

    /// The recorded log.
    #[must_use]
    pub const fn log(&self) -> &ReplayLog {
        &self.log
    }

    /// Number of records playback can produce.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.visible.len()
    }

    /// Returns `true` when playback can produce nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    /// Identifier of the simulated client, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.simulator.as_ref().map(ClientSimulator::client_id)
    }

    /// Returns `true` when [`ReplayTransport::step`] would produce a record.
    #[must_use]
    pub fn available(&self) -> bool {
        !self.queue.is_closed() && self.cursor() < self.visible.len()
    }

    /// Queues and returns the record at the cursor, then advances.
    #[must_use]
    pub fn step(&self) -> Option<Data> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.visible.get(*cursor).cloned()?;
        *cursor = cursor.saturating_add(1);
        drop(cursor);
        self.emit(record)
    }

    /// Moves to the record with `sequence`, or the first one after it.
    #[must_use]
    pub fn seek_sequence(&self, sequence: u64) -> Option<Data> {
        let position = position_of_sequence(&self.visible, sequence);
        self.seek_to(position)
    }

    /// Moves to the first record captured at or after `timestamp`.
    #[must_use]
    pub fn seek_timestamp(&self, timestamp: f64) -> Option<Data> {
        let position = position_of_timestamp(&self.visible, timestamp);
        self.seek_to(position)
    }

    fn seek_to(&self, position: Option<usize>) -> Option<Data> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = position else {
            *cursor = self.visible.len();
            return None;
        };
        *cursor = index.saturating_add(1);
        drop(cursor);
        let record = self.visible.get(index).cloned()?;
        self.emit(record)
    }

    fn emit(&self, record: Data) -> Option<Data> {
        if !self.queue.push(record.clone()) {
            trace!(target: TRANSPORT_TARGET, "replay closed, record not queued");
            return None;
        }
        Some(record)
    }

    fn cursor(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for ReplayTransport {
    fn send(&self, command: Command) {
        debug!(
            target: TRANSPORT_TARGET,
            address = %command.address,
            data_type = %command.data_type,
            "replay drops outbound command"
        );
    }

    fn receive(&self, timeout: Duration) -> Received {
        self.queue.receive(timeout)
    }

    fn drain(&self) -> usize {
        self.queue.drain()
    }

    fn close(&self) {
        if self.queue.close() {
            debug!(target: TRANSPORT_TARGET, "replay transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;
    use serde_json::json;
    use tether_wire::{Address, encode_data, encode_line};

    use crate::session::{CONNECTED_CLIENTS, SESSION_MANAGER};

    use super::*;

    fn record(seq: u64, ts: f64) -> Data {
        Data::new(Address::new("camera", "front"), "color")
            .with_seq(seq)
            .with_ts(ts)
    }

    #[fixture]
    fn transport() -> ReplayTransport {
        ReplayTransport::new(ReplayLog::from_records(vec![
            record(1, 10.0),
            record(2, 10.5),
            record(4, 11.0),
            record(5, 12.0),
        ]))
    }

    fn write_file(dir: &Utf8Path, index: u32, lines: &[String]) {
        write_into(dir, DEVICE_DATA, index, lines);
    }

    fn write_into(dir: &Utf8Path, kind: &str, index: u32, lines: &[String]) {
        let path = dir.join(kind).join(format!("{index:05}.json"));
        fs::write(path, lines.join("\n")).expect("write log file");
    }

    fn encoded(data: &Data) -> String {
        String::from_utf8(encode_data(data).expect("encode"))
            .expect("utf-8")
            .trim_end()
            .to_owned()
    }

    #[rstest]
    fn loads_until_the_first_missing_index() {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 path");
        fs::create_dir(root.join(DEVICE_DATA)).expect("mkdir");
        write_file(root, 0, &[encoded(&record(1, 1.0)), "garbage".to_owned()]);
        write_file(root, 1, &[encoded(&record(2, 2.0))]);
        write_file(root, 3, &[encoded(&record(9, 9.0))]);
        let log = ReplayLog::load_directory(root).expect("load");
        let sequences: Vec<_> = log.records().iter().filter_map(|data| data.seq).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    fn listing(ts: f64, clients: serde_json::Value) -> Data {
        Data::new(Address::singleton(SESSION_MANAGER), CONNECTED_CLIENTS)
            .with_ts(ts)
            .with_field("connectedClients", json!({ "clients": clients }))
    }

    #[rstest]
    fn command_data_is_loaded_when_present() {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 path");
        fs::create_dir(root.join(DEVICE_DATA)).expect("mkdir");
        fs::create_dir(root.join(COMMAND_DATA)).expect("mkdir");
        write_file(root, 0, &[encoded(&record(1, 1.0))]);
        let command = Command::new(Address::singleton("arm"), "move").with_tag("t-1");
        let line = String::from_utf8(encode_line(&command).expect("encode")).expect("utf-8");
        write_into(root, COMMAND_DATA, 0, &[line.trim_end().to_owned()]);
        let log = ReplayLog::load_directory(root).expect("load");
        assert_eq!(log.len(), 1);
        assert_eq!(log.commands().len(), 1);
        assert_eq!(
            log.commands().first().and_then(|found| found.tag.as_deref()),
            Some("t-1")
        );
    }

    #[rstest]
    fn simulated_client_sees_only_its_traffic() {
        let mut issued = Command::new(Address::singleton("arm"), "move").with_tag("mine");
        issued.payload.insert("originClient".to_owned(), json!("b"));
        let log = ReplayLog::from_records(vec![
            record(1, 1.0),
            listing(2.0, json!([{"uid": "b", "isCurrent": false}])),
            record(3, 3.0),
            record(4, 3.5).with_tag("theirs"),
            record(5, 4.0).with_tag("mine"),
            listing(6.0, json!([{"uid": "a"}])),
            record(7, 7.0),
        ])
        .with_commands(vec![issued]);
        let transport =
            ReplayTransport::simulating(log, &ReplayClient::Uid("b".to_owned())).expect("client");
        assert_eq!(transport.client_id(), Some("b"));
        assert_eq!(transport.len(), 3);
        let first = transport.step().expect("listing");
        let flags: Vec<_> = first
            .connected_clients()
            .expect("listing")
            .clients
            .iter()
            .map(|client| client.is_current)
            .collect();
        assert_eq!(flags, vec![true]);
        let rest: Vec<_> = std::iter::from_fn(|| transport.step())
            .filter_map(|data| data.seq)
            .collect();
        assert_eq!(rest, vec![3, 5]);
        assert_eq!(transport.seek_sequence(4).and_then(|data| data.seq), Some(5));
    }

    #[rstest]
    fn unsimulated_replay_marks_no_client_current() {
        let transport = ReplayTransport::new(ReplayLog::from_records(vec![listing(
            1.0,
            json!([{"uid": "a", "isCurrent": true}]),
        )]));
        assert_eq!(transport.client_id(), None);
        let seen = transport.step().expect("listing");
        let listing = seen.connected_clients().expect("listing");
        assert!(listing.clients.iter().all(|client| !client.is_current));
    }

    #[rstest]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 path");
        assert!(matches!(
            ReplayLog::load_directory(root),
            Err(ReplayError::MissingDirectory { .. })
        ));
    }

    #[rstest]
    fn step_walks_the_log_in_order(transport: ReplayTransport) {
        let seen: Vec<_> = std::iter::from_fn(|| transport.step())
            .filter_map(|data| data.seq)
            .collect();
        assert_eq!(seen, vec![1, 2, 4, 5]);
        assert!(!transport.available());
        assert_eq!(transport.drain(), 4);
    }

    #[rstest]
    #[case(2, Some(2))]
    #[case(3, Some(4))]
    #[case(6, None)]
    fn sequence_seek_prefers_exact_then_next(
        transport: ReplayTransport,
        #[case] target: u64,
        #[case] expected: Option<u64>,
    ) {
        assert_eq!(transport.seek_sequence(target).and_then(|data| data.seq), expected);
        assert_eq!(transport.seek_sequence(target).and_then(|data| data.seq), expected);
    }

    #[rstest]
    fn timestamp_seek_never_returns_earlier_records(transport: ReplayTransport) {
        let found = transport.seek_timestamp(10.7).expect("record");
        assert!(found.ts.is_some_and(|ts| ts >= 10.7));
        assert_eq!(found.seq, Some(4));
        assert_eq!(transport.step().and_then(|data| data.seq), Some(5));
    }

    #[rstest]
    fn seek_queues_the_record_for_receive(transport: ReplayTransport) {
        let found = transport.seek_sequence(2).expect("record");
        assert_eq!(transport.receive(Duration::ZERO), Received::Data(found));
    }

    #[rstest]
    fn closed_replay_produces_nothing(transport: ReplayTransport) {
        transport.close();
        assert!(!transport.available());
        assert!(transport.step().is_none());
        assert_eq!(transport.receive(Duration::ZERO), Received::Closed);
    }
}
