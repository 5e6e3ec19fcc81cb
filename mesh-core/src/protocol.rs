//! Agent wire protocol: envelope, payload, command names and topic layout.

use serde::{Deserialize, Serialize};

/// Maximum length (in characters) of sender ids and command names.
pub const ID_CAP: usize = 12;

/// Sender id used when the payload carried no identity.
pub const UNKNOWN_SENDER: &str = "unknown";
/// Command assigned to payloads that were not structured envelopes.
pub const TEXT_MESSAGE: &str = "text_message";
/// Command assigned to structured payloads without a command field.
pub const NO_COMMAND: &str = "none";

pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const CMD_TRANSFER_BEGIN: &str = "bg_t";
pub const CMD_TRANSFER_APPEND: &str = "ap_t";
pub const CMD_TRANSFER_END: &str = "end_t";

/// Broadcast topic for heartbeat and discovery traffic.
pub const BROADCAST_TOPIC: &str = "devices/all/data";

/// Unicast command topic for one device.
pub fn command_topic(device_id: &str) -> String {
    format!("devices/{}/cmd", device_id)
}

/// Cut an identifier down to [`ID_CAP`] characters. Lossy; distinct long ids may collide.
pub fn truncate_id(id: &str) -> String {
    match id.char_indices().nth(ID_CAP) {
        Some((idx, _)) => id[..idx].to_string(),
        None => id.to_string(),
    }
}

/// Envelope body: raw bytes or text. Bytes round-trip untouched through the binary codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Bytes(Vec::new())
    }

    /// Borrow the payload as bytes; text is viewed as its UTF-8 encoding.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.into_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    /// Text view of the payload, replacing invalid UTF-8 sequences.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(b.to_vec())
    }
}

/// Application message carried inside one transport payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: String,
    pub command: String,
    pub message: Payload,
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Build an envelope; both identifiers are truncated to [`ID_CAP`].
    pub fn new(sender_id: &str, command: &str, message: impl Into<Payload>) -> Self {
        Self {
            sender_id: truncate_id(sender_id),
            command: truncate_id(command),
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp with the current unix time in seconds.
    pub fn stamped(self) -> Self {
        self.with_timestamp(unix_now())
    }

    /// Envelope for a payload that could not be decoded as a structured message.
    pub fn text_fallback(raw: &[u8]) -> Self {
        Self::new(
            UNKNOWN_SENDER,
            TEXT_MESSAGE,
            String::from_utf8_lossy(raw).into_owned(),
        )
    }

    /// Re-apply the identifier cap; used on both encode and decode paths.
    pub(crate) fn truncated(mut self) -> Self {
        self.sender_id = truncate_id(&self.sender_id);
        self.command = truncate_id(&self.command);
        self
    }
}

/// Seconds since the unix epoch; 0 if the clock is before the epoch.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
