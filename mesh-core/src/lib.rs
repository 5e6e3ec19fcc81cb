//! Device agent protocol over a publish/subscribe transport.
//! Command routing, peer discovery, heartbeat and chunked file transfer between short-id devices.

pub mod agent;
pub mod commands;
pub mod config;
pub mod devices;
pub mod error;
pub mod flush;
pub mod heartbeat;
pub mod message_log;
pub mod protocol;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use agent::{Agent, AgentBuilder, MessageObserver};
pub use commands::{CommandHandler, DispatchOutcome};
pub use config::{AgentConfig, ConfigError};
pub use error::AgentError;
pub use message_log::LogEntry;
pub use protocol::{Envelope, Payload, ID_CAP};
pub use transfer::{ExtractAs, TransferError};
pub use transport::memory::{MemoryBroker, MemoryTransport};
pub use transport::{ConnectOptions, Credentials, MessageCallback, Transport, TransportError};
pub use wire::{decode, encode, EncodeError};
