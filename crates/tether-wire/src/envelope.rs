//! Outbound [`Command`] and inbound [`Data`] envelopes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::address::Address;

/// Completion state reported by the host for a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The command is still executing.
    Running,
    /// The command completed.
    Done,
    /// The host refused the command.
    Rejected,
    /// The command started but was aborted.
    Aborted,
    /// A status string this client does not recognise.
    Unknown,
}

impl Status {
    /// Parses a wire status string; unrecognised values map to
    /// [`Status::Unknown`].
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "done" => Self::Done,
            "rejected" => Self::Rejected,
            "aborted" => Self::Aborted,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` when the status ends a tag correlation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Aborted)
    }
}

/// Outbound message sent to the host.
///
/// A command without a tag is fire-and-forget: the host may still answer, but
/// nothing can be correlated with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Send time in float seconds since the Unix epoch.
    #[serde(default)]
    pub ts: f64,
    /// Target device.
    #[serde(flatten)]
    pub address: Address,
    /// Operation requested from the device.
    #[serde(rename = "dataType", default)]
    pub data_type: String,
    /// Correlation tag chosen by the caller.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub tag: Option<String>,
    /// Key for key-value reads.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub key: Option<String>,
    /// Operation-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Command {
    /// Builds an untagged command for `data_type` on `address`.
    #[must_use]
    pub fn new(address: Address, data_type: impl Into<String>) -> Self {
        Self {
            ts: 0.0,
            address,
            data_type: data_type.into(),
            tag: None,
            key: None,
            payload: Map::new(),
        }
    }

    /// Sets the correlation tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the key-value key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds an operation-specific field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Stamps the send time with the current wall clock.
    pub fn stamp(&mut self) {
        self.ts = now_seconds();
    }
}

/// Inbound message received from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// Host wall-clock capture time in float seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    /// Producing device.
    #[serde(flatten)]
    pub address: Address,
    /// Kind of payload carried.
    #[serde(rename = "dataType", default)]
    pub data_type: String,
    /// Correlation tag copied from the originating command.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub tag: Option<String>,
    /// Key of a key-value answer.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub key: Option<String>,
    /// Host-assigned sequence number, monotonic per address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Command completion status, set on `cmd-status` messages.
    #[serde(
        default,
        deserialize_with = "optional_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<Status>,
    /// Operation-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Data {
    /// Builds an empty inbound message for `data_type` on `address`.
    #[must_use]
    pub fn new(address: Address, data_type: impl Into<String>) -> Self {
        Self {
            ts: None,
            address,
            data_type: data_type.into(),
            tag: None,
            key: None,
            seq: None,
            status: None,
            payload: Map::new(),
        }
    }

    /// Sets the correlation tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the sequence number.
    #[must_use]
    pub const fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Sets the capture timestamp.
    #[must_use]
    pub const fn with_ts(mut self, ts: f64) -> Self {
        self.ts = Some(ts);
        self
    }

    /// Sets the completion status.
    #[must_use]
    pub const fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the key-value key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds an operation-specific field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Looks up an operation-specific field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Returns `true` when the message carries a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(Status::is_terminal)
    }
}

/// Current wall-clock time in float seconds since the Unix epoch.
#[must_use]
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.is_empty()))
}

fn optional_status<'de, D>(deserializer: D) -> Result<Option<Status>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .filter(|value| !value.is_empty())
        .map(|value| Status::from_wire(&value)))
}
