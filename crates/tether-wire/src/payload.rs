//! Typed views over operation-specific payload fields.
//!
//! The envelope keeps payloads as raw JSON; these helpers decode the few
//! payloads the engine itself interprets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::WireError;
use crate::envelope::{Command, Data};

/// `msg-type` announced by a bridge tool once its data server is listening.
pub const BRIDGE_MSG_TYPE: &str = "device-data-server";

/// One entry of a `machine-interfaces` discovery answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInterfaceEntry {
    /// Interaction style, e.g. `frame-request` or `publish`.
    pub interface_type: String,
    /// Device kind.
    pub device_type: String,
    /// Device name.
    #[serde(default)]
    pub device_name: String,
    /// Kind of data the interface produces.
    #[serde(default)]
    pub data_type: String,
    /// Key-value keys exposed by the interface.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Client list carried by `connected-clients` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedClients {
    /// Connected clients in host order.
    #[serde(default)]
    pub clients: Vec<ConnectedClient>,
}

/// One client known to the host's session manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    /// Host-assigned client identifier.
    #[serde(default)]
    pub uid: String,
    /// Set on the entry describing the receiving client.
    #[serde(default)]
    pub is_current: bool,
    /// Set on the client currently holding a control session.
    #[serde(default)]
    pub control_session_active: bool,
}

/// Per-client delivery entry of a message addressed to specific clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToClient {
    /// Receiving client.
    #[serde(default)]
    pub uid: String,
    /// Tag the message carries for that client.
    #[serde(default)]
    pub tag: String,
}

/// First stdout line printed by an external bridge tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeHandshake {
    /// Message type; must equal [`BRIDGE_MSG_TYPE`].
    #[serde(rename = "msg-type")]
    pub msg_type: String,
    /// Host the bridge listens on.
    pub hostname: String,
    /// Port the bridge listens on.
    pub port: u16,
}

impl BridgeHandshake {
    /// Parses and validates a handshake line.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] when the line is not a handshake object
    /// and [`WireError::UnexpectedHandshake`] when it announces anything other
    /// than a device data server.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let handshake: Self = serde_json::from_str(line.trim())?;
        if handshake.msg_type != BRIDGE_MSG_TYPE {
            return Err(WireError::UnexpectedHandshake {
                msg_type: handshake.msg_type,
            });
        }
        Ok(handshake)
    }
}

impl Data {
    /// Decodes the `machineInterfaces` array of a discovery answer.
    ///
    /// Entries that are not objects of the expected shape are dropped; the
    /// caller decides what to do with unknown interface types.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MissingField`] when the field is absent or not an
    /// array.
    pub fn machine_interfaces(&self) -> Result<Vec<MachineInterfaceEntry>, WireError> {
        let Some(Value::Array(entries)) = self.field("machineInterfaces") else {
            return Err(WireError::MissingField {
                field: "machineInterfaces",
            });
        };
        Ok(entries
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect())
    }

    /// Decodes the `connectedClients` payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MissingField`] when absent and
    /// [`WireError::Decode`] when malformed.
    pub fn connected_clients(&self) -> Result<ConnectedClients, WireError> {
        let value = self.field("connectedClients").ok_or(WireError::MissingField {
            field: "connectedClients",
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Decodes the `sendToClients` routing list; empty when absent or
    /// malformed.
    #[must_use]
    pub fn send_to_clients(&self) -> Vec<SendToClient> {
        self.field("sendToClients")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// Returns `true` when the host marked the message as not for clients.
    #[must_use]
    pub fn inhibits_frame_send(&self) -> bool {
        self.field("inhibitFrameSend")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the `(key, value)` pair of a key-value answer.
    #[must_use]
    pub fn key_value(&self) -> Option<(&str, &str)> {
        let key = self.key.as_deref()?;
        let value = self.field("value")?.as_str()?;
        Some((key, value))
    }
}

impl Command {
    /// Client that issued a recorded command; `None` for client-side logs.
    #[must_use]
    pub fn origin_client(&self) -> Option<&str> {
        self.payload
            .get("originClient")
            .and_then(Value::as_str)
            .filter(|uid| !uid.is_empty())
    }
}
