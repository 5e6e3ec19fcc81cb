//! Pub/sub transport seam. The agent only needs connect, subscribe, publish and a receive callback;
//! the broker protocol itself lives behind this trait.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

/// Called for every message the transport receives: `(topic, payload)`.
/// May run on a transport-owned I/O thread.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connection parameters handed to the transport as-is.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
}

pub trait Transport: Send + Sync {
    fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError>;
    fn subscribe(&self, filter: &str) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    /// Start delivering received messages to `on_message`.
    fn start(&self, on_message: MessageCallback) -> Result<(), TransportError>;
    /// Stop delivering messages. Safe to call more than once.
    fn stop(&self);
    /// Release the connection. Safe to call more than once.
    fn disconnect(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("receive loop already started")]
    AlreadyStarted,
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// MQTT-style filter match: `+` matches one level, a trailing `#` matches the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject filters with wildcards in the wrong place.
pub fn validate_filter(filter: &str) -> Result<(), TransportError> {
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let bad_hash = level.contains('#') && (*level != "#" || i != levels.len() - 1);
        let bad_plus = level.contains('+') && *level != "+";
        if filter.is_empty() || bad_hash || bad_plus {
            return Err(TransportError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}
