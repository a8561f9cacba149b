//! Newline-delimited JSON framing.

use serde::Serialize;
use thiserror::Error;

use crate::envelope::{Command, Data};

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The line was empty or whitespace.
    #[error("empty line")]
    Empty,
    /// JSON encoding or decoding failed.
    #[error("invalid JSON message: {0}")]
    Decode(#[from] serde_json::Error),
    /// A payload field the caller asked for is absent.
    #[error("missing payload field '{field}'")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
    /// A bridge tool announced something other than a data server.
    #[error("unexpected bridge handshake message type '{msg_type}'")]
    UnexpectedHandshake {
        /// Message type found on the first line.
        msg_type: String,
    },
}

/// Encodes a command as one JSON line terminated by `\n`.
///
/// # Errors
///
/// Returns [`WireError::Decode`] if serialisation fails.
pub fn encode_line(command: &Command) -> Result<Vec<u8>, WireError> {
    encode(command)
}

/// Encodes an inbound message as one JSON line, as a host or a recorder would.
///
/// # Errors
///
/// Returns [`WireError::Decode`] if serialisation fails.
pub fn encode_data(data: &Data) -> Result<Vec<u8>, WireError> {
    encode(data)
}

/// Decodes one line into an inbound message.
///
/// # Errors
///
/// Returns [`WireError::Empty`] for blank lines and [`WireError::Decode`]
/// for anything that is not a JSON object of the expected shape.
pub fn decode_line(line: &str) -> Result<Data, WireError> {
    let trimmed = non_empty(line)?;
    Ok(serde_json::from_str(trimmed)?)
}

/// Decodes one line into a command, as a host would.
///
/// # Errors
///
/// Same as [`decode_line`].
pub fn decode_command(line: &str) -> Result<Command, WireError> {
    let trimmed = non_empty(line)?;
    Ok(serde_json::from_str(trimmed)?)
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn non_empty(line: &str) -> Result<&str, WireError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Err(WireError::Empty)
    } else {
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{Address, Status};

    #[test]
    fn command_line_omits_absent_fields() {
        let command = Command::new(
            Address::singleton("discovery-aggregator"),
            "machine-interfaces-request",
        )
        .with_tag("t-1");
        let bytes = encode_line(&command).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim()).expect("json");
        assert_eq!(value["deviceType"], json!("discovery-aggregator"));
        assert_eq!(value["deviceName"], json!(""));
        assert_eq!(value["dataType"], json!("machine-interfaces-request"));
        assert_eq!(value["tag"], json!("t-1"));
        assert!(value.get("key").is_none());
    }

    #[test]
    fn decodes_inbound_envelope_and_payload() {
        let line = r#"{"ts":12.5,"deviceType":"robot","deviceName":"","dataType":"cmd-status","tag":"abc","seq":42,"status":"done","error":""}"#;
        let data = decode_line(line).expect("decode");
        assert_eq!(data.address, Address::singleton("robot"));
        assert_eq!(data.tag.as_deref(), Some("abc"));
        assert_eq!(data.seq, Some(42));
        assert_eq!(data.status, Some(Status::Done));
        assert_eq!(data.field("error"), Some(&json!("")));
    }

    #[test]
    fn empty_tag_and_status_are_absent() {
        let line = r#"{"deviceType":"arm","dataType":"robot-state","tag":"","status":""}"#;
        let data = decode_line(line).expect("decode");
        assert!(data.tag.is_none());
        assert!(data.status.is_none());
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("{not json")]
    #[case("[1, 2, 3]")]
    fn rejects_malformed_lines(#[case] line: &str) {
        assert!(decode_line(line).is_err());
    }
}
