//! Errors returned by the agent runtime.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;
use crate::wire::EncodeError;

/// Errors surfaced by the agent runtime to its caller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Encode(#[from] EncodeError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Chunk budget does not leave room for any payload after the envelope overhead.
    #[error("chunk budget {budget} leaves no room for payload (envelope overhead is {overhead} bytes)")]
    ChunkBudget { budget: usize, overhead: usize },
    #[error("agent is already connected")]
    AlreadyConnected,
    #[error("agent has been shut down")]
    Closed,
    #[error("no tokio runtime available to host background tasks")]
    NoRuntime,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
