//! Hub JSON protocol framing for the push channel
//!
//! Every record is a JSON object terminated by the ASCII record separator.
//! A single WebSocket text frame may carry several records.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Terminates every record on the wire
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Subscribe this client to roster updates
pub const MAKE_LISTENER: &str = "MakeListener";
/// Set or clear the server-side listener target
pub const SET_VIDEO_ID: &str = "SetVideoId";
/// Server push carrying the full roster
pub const UPDATE_WATCHERS: &str = "UpdateWatchers";
/// Server push echoing the current listener target
pub const STREAMLABS_TOKEN_UPDATED: &str = "StreamlabsTokenUpdated";

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

#[derive(Debug, Serialize)]
struct HandshakeRequest {
    protocol: &'static str,
    version: u32,
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Outbound invocation record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    #[serde(rename = "type")]
    kind: u8,
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<serde_json::Value>,
}

impl InvocationRequest {
    pub fn new(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            kind: TYPE_INVOCATION,
            invocation_id: invocation_id.into(),
            target: target.into(),
            arguments,
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        encode(self)
    }
}

/// Wire shape shared by every inbound record type
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Inbound hub message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Server-to-client call; pushes carry no invocation id
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<serde_json::Value>,
    },
    /// Result of a client invocation
    Completion {
        invocation_id: String,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    Ping,
    /// Server is closing the connection
    Close { error: Option<String> },
    /// Record types this client does not act on (stream items etc.)
    Other(u8),
}

impl HubMessage {
    /// Parse one record (without its separator)
    pub fn parse(record: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(record)?;
        match raw.kind {
            TYPE_INVOCATION => {
                let target = raw.target.ok_or_else(|| {
                    SyncError::Protocol("Invocation record without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments,
                })
            }
            TYPE_COMPLETION => {
                let invocation_id = raw.invocation_id.ok_or_else(|| {
                    SyncError::Protocol("Completion record without invocationId".to_string())
                })?;
                Ok(HubMessage::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            TYPE_PING => Ok(HubMessage::Ping),
            TYPE_CLOSE => Ok(HubMessage::Close { error: raw.error }),
            other => Ok(HubMessage::Other(other)),
        }
    }
}

/// Split a text frame into its non-empty records
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// First frame sent on every new connection
pub fn handshake_frame() -> Result<String> {
    encode(&HandshakeRequest {
        protocol: "json",
        version: 1,
    })
}

/// Validate the server's handshake answer
pub fn parse_handshake(record: &str) -> Result<()> {
    let response: HandshakeResponse = serde_json::from_str(record)?;
    match response.error {
        Some(error) => Err(SyncError::HandshakeRejected(error)),
        None => Ok(()),
    }
}

/// Keep-alive record
pub fn ping_frame() -> String {
    format!("{{\"type\":{}}}{}", TYPE_PING, RECORD_SEPARATOR)
}

fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut frame = serde_json::to_string(message)?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}
