//! JSON hub protocol framing.
//!
//! Every record is a JSON object terminated by `0x1E`. A connection opens with
//! a handshake record in each direction, after which records carry a numeric
//! `type`.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{HubEvent, HubInvocation};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is missing a message type")]
    MissingType,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("unknown hub method {0}")]
    UnknownTarget(String),
    #[error("{target} expects {expected} argument(s), got {got}")]
    Arity {
        target: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items and other record types this client never requests.
    Other(u64),
}

pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

pub fn parse_handshake_response(record: &str) -> Result<(), ProtocolError> {
    let resp: HandshakeResponse = serde_json::from_str(record)?;
    match resp.error {
        Some(error) => Err(ProtocolError::HandshakeRejected(error)),
        None => Ok(()),
    }
}

/// Splits a transport message into its records, skipping empty trailers.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<u64>,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

pub fn parse_frame(record: &str) -> Result<HubFrame, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(record)?;
    let frame = match raw.kind.ok_or(ProtocolError::MissingType)? {
        INVOCATION => HubFrame::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.unwrap_or_default(),
            arguments: raw.arguments,
        },
        COMPLETION => HubFrame::Completion {
            invocation_id: raw.invocation_id.unwrap_or_default(),
            error: raw.error,
        },
        PING => HubFrame::Ping,
        CLOSE => HubFrame::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubFrame::Other(other),
    };
    Ok(frame)
}

fn single_argument(target: &str, mut arguments: Vec<Value>) -> Result<Value, ProtocolError> {
    if arguments.len() != 1 {
        return Err(ProtocolError::Arity {
            target: target.to_string(),
            expected: 1,
            got: arguments.len(),
        });
    }
    Ok(arguments.remove(0))
}

/// Maps a server invocation onto the events this client understands.
pub fn decode_event(target: &str, arguments: Vec<Value>) -> Result<HubEvent, ProtocolError> {
    match target {
        "ReceiveMessageThread" => Ok(HubEvent::ReceiveMessageThread(serde_json::from_value(
            single_argument(target, arguments)?,
        )?)),
        "NewMessage" => Ok(HubEvent::NewMessage(serde_json::from_value(
            single_argument(target, arguments)?,
        )?)),
        "UpdatedGroup" => Ok(HubEvent::UpdatedGroup(serde_json::from_value(
            single_argument(target, arguments)?,
        )?)),
        other => Err(ProtocolError::UnknownTarget(other.to_string())),
    }
}

pub fn encode_invocation(
    invocation_id: &str,
    invocation: &HubInvocation,
) -> Result<String, ProtocolError> {
    let record = json!({
        "type": INVOCATION,
        "invocationId": invocation_id,
        "target": invocation.target(),
        "arguments": invocation.arguments()?,
    });
    Ok(format!("{record}{RECORD_SEPARATOR}"))
}

pub fn encode_ping() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}
