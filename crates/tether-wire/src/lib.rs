//! Wire envelope shared by every part of the tether engine.
//!
//! The robot-control host speaks newline-delimited JSON. Outbound objects are
//! [`Command`]s, inbound objects are [`Data`]. Both carry the same addressing
//! fields (`deviceType`, `deviceName`, `dataType`) and an optional correlation
//! `tag`; inbound objects additionally carry a host-assigned `seq`, a capture
//! timestamp and an optional terminal [`Status`].
//!
//! Only the envelope and correlation fields are typed. Operation-specific
//! payload fields travel in a flattened JSON map and are interpreted through
//! the typed views in [`payload`].

mod address;
mod codec;
mod envelope;
pub mod payload;
mod tag;

pub use address::Address;
pub use codec::{WireError, decode_command, decode_line, encode_data, encode_line};
pub use envelope::{Command, Data, Status, now_seconds};
pub use payload::{
    BridgeHandshake, ConnectedClient, ConnectedClients, MachineInterfaceEntry, SendToClient,
};
pub use tag::{TagGenerator, fresh_tag};

/// `dataType` of a command status message.
pub const CMD_STATUS: &str = "cmd-status";
/// `dataType` used to poll a device for its next sample.
pub const FRAME_REQUEST: &str = "frame-request";
/// `dataType` of a key-value read request.
pub const KEY_VALUE_REQUEST: &str = "key-value-request";
/// `dataType` of a key-value answer.
pub const KEY_VALUE: &str = "key-value";
