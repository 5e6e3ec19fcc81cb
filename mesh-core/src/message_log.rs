//! Append-only record of received envelopes, in arrival order.

use std::time::SystemTime;

use crate::protocol::{Envelope, Payload};

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub received_at: SystemTime,
    pub sender_id: String,
    pub command: String,
    /// Timestamp the sender put in the envelope, if any.
    pub timestamp_sent: Option<i64>,
    pub topic: String,
    pub message: Payload,
}

impl LogEntry {
    pub fn from_envelope(topic: &str, envelope: &Envelope) -> Self {
        Self {
            received_at: SystemTime::now(),
            sender_id: envelope.sender_id.clone(),
            command: envelope.command.clone(),
            timestamp_sent: envelope.timestamp,
            topic: topic.to_string(),
            message: envelope.message.clone(),
        }
    }
}

#[derive(Default)]
pub struct MessageLog {
    entries: Vec<LogEntry>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Copy of all entries so far; later appends do not affect it.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
