//! Chunked file transfer: per-sender reassembly state machine and sender-side splitting.
//!
//! A sender announces a file with `bg_t`, streams `ap_t` chunks and closes it with `end_t`.
//! The receiver keeps at most one transfer per sender; a new begin replaces an unflushed one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AgentError;
use crate::protocol::{Envelope, Payload, CMD_TRANSFER_APPEND, CMD_TRANSFER_BEGIN, CMD_TRANSFER_END};
use crate::wire::{self, EncodeError};

/// Chunk range within the outbound payload: `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

/// Split `total_len` bytes into consecutive ranges of `max_chunk` bytes; the last may be shorter.
pub fn split_into_chunks(total_len: usize, max_chunk: usize) -> Vec<ChunkRange> {
    if max_chunk == 0 {
        return vec![];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(max_chunk));
    let mut start = 0usize;
    while start < total_len {
        let end = (start + max_chunk).min(total_len);
        out.push(ChunkRange { start, end });
        start = end;
    }
    out
}

/// Encoded size of an append envelope with an empty payload: the fixed cost of every chunk message.
pub fn chunk_overhead(sender_id: &str) -> Result<usize, EncodeError> {
    let probe = Envelope::new(sender_id, CMD_TRANSFER_APPEND, Payload::empty()).stamped();
    Ok(wire::encode(&probe)?.len())
}

/// Payload bytes that fit in one message of `budget` encoded bytes.
pub fn max_chunk_len(budget: usize, overhead: usize) -> Result<usize, AgentError> {
    match budget.checked_sub(overhead) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(AgentError::ChunkBudget { budget, overhead }),
    }
}

/// Full outbound message sequence for one file: begin, appends in order, end.
pub fn transfer_envelopes(
    sender_id: &str,
    file_name: &str,
    payload: &[u8],
    max_chunk: usize,
) -> Vec<Envelope> {
    let chunks = split_into_chunks(payload.len(), max_chunk);
    let mut out = Vec::with_capacity(chunks.len() + 2);
    out.push(Envelope::new(sender_id, CMD_TRANSFER_BEGIN, file_name).stamped());
    for c in chunks {
        out.push(
            Envelope::new(sender_id, CMD_TRANSFER_APPEND, &payload[c.start..c.end]).stamped(),
        );
    }
    out.push(Envelope::new(sender_id, CMD_TRANSFER_END, Payload::empty()).stamped());
    out
}

/// Failed writes after which a finished transfer is dropped instead of retried.
pub const MAX_FLUSH_ATTEMPTS: u32 = 3;

/// Inbound transfer from one sender.
#[derive(Debug)]
pub struct TransferState {
    pub sender_id: String,
    pub file_name: String,
    /// Shared with an in-flight flush; appends copy only if a flush still holds it.
    data: Arc<Vec<u8>>,
    done: bool,
    generation: u64,
    flush_failures: u32,
}

impl TransferState {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn flush_failures(&self) -> u32 {
        self.flush_failures
    }
}

/// How `extract` should hand back the collected bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractAs {
    Bytes,
    /// UTF-8 text; falls back to raw bytes when the data is not valid UTF-8.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no transfer in progress from {0}")]
    NotFound(String),
    #[error("transfer from {0} has not ended yet")]
    NotReady(String),
}

/// Finished transfer handed out for flushing. Only releases the entry it was taken from.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub sender_id: String,
    pub file_name: String,
    pub data: Arc<Vec<u8>>,
    generation: u64,
}

/// Live transfers keyed by sender id.
#[derive(Default)]
pub struct TransferTable {
    transfers: HashMap<String, TransferState>,
    next_generation: u64,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a transfer from `sender_id`. Returns true if an unflushed transfer was replaced.
    pub fn begin(&mut self, sender_id: &str, file_name: &str) -> bool {
        self.next_generation = self.next_generation.wrapping_add(1);
        let state = TransferState {
            sender_id: sender_id.to_string(),
            file_name: file_name.to_string(),
            data: Arc::new(Vec::new()),
            done: false,
            generation: self.next_generation,
            flush_failures: 0,
        };
        self.transfers.insert(sender_id.to_string(), state).is_some()
    }

    /// Append a chunk. Returns false (chunk dropped) when no transfer exists for the sender.
    pub fn append(&mut self, sender_id: &str, chunk: &[u8]) -> bool {
        match self.transfers.get_mut(sender_id) {
            Some(state) => {
                Arc::make_mut(&mut state.data).extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    /// Close a transfer, appending any trailing bytes. Returns false when no transfer exists.
    pub fn end(&mut self, sender_id: &str, trailing: &[u8]) -> bool {
        match self.transfers.get_mut(sender_id) {
            Some(state) => {
                if !trailing.is_empty() {
                    Arc::make_mut(&mut state.data).extend_from_slice(trailing);
                }
                state.done = true;
                true
            }
            None => false,
        }
    }

    /// Remove a finished transfer and return `(file_name, content)`.
    pub fn extract(
        &mut self,
        sender_id: &str,
        as_: ExtractAs,
    ) -> Result<(String, Payload), TransferError> {
        match self.transfers.get(sender_id) {
            None => return Err(TransferError::NotFound(sender_id.to_string())),
            Some(state) if !state.done => {
                return Err(TransferError::NotReady(sender_id.to_string()))
            }
            Some(_) => {}
        }
        let state = self
            .transfers
            .remove(sender_id)
            .ok_or_else(|| TransferError::NotFound(sender_id.to_string()))?;
        let data = Arc::try_unwrap(state.data).unwrap_or_else(|shared| (*shared).clone());
        let content = match as_ {
            ExtractAs::Bytes => Payload::Bytes(data),
            ExtractAs::Text => match String::from_utf8(data) {
                Ok(text) => Payload::Text(text),
                Err(e) => Payload::Bytes(e.into_bytes()),
            },
        };
        Ok((state.file_name, content))
    }

    /// Some finished transfer, if any. Transfers with fewer failed writes go first;
    /// order among equals is unspecified. The buffer is shared, not copied.
    pub fn next_completed(&self) -> Option<CompletedTransfer> {
        self.transfers
            .values()
            .filter(|s| s.done)
            .min_by_key(|s| s.flush_failures)
            .map(|s| CompletedTransfer {
                sender_id: s.sender_id.clone(),
                file_name: s.file_name.clone(),
                data: Arc::clone(&s.data),
                generation: s.generation,
            })
    }

    /// Count a failed write for the entry `completed` came from. After [`MAX_FLUSH_ATTEMPTS`]
    /// failures the entry is dropped; returns true in that case.
    pub fn record_flush_failure(&mut self, completed: &CompletedTransfer) -> bool {
        let Some(state) = self
            .transfers
            .get_mut(&completed.sender_id)
            .filter(|s| s.generation == completed.generation)
        else {
            return false;
        };
        state.flush_failures += 1;
        if state.flush_failures < MAX_FLUSH_ATTEMPTS {
            return false;
        }
        self.transfers.remove(&completed.sender_id);
        true
    }

    /// Drop the entry `completed` was copied from. No-op if it has since been replaced by a new begin.
    pub fn release(&mut self, completed: &CompletedTransfer) -> bool {
        let same = self
            .transfers
            .get(&completed.sender_id)
            .is_some_and(|s| s.generation == completed.generation);
        if same {
            self.transfers.remove(&completed.sender_id);
        }
        same
    }

    pub fn get(&self, sender_id: &str) -> Option<&TransferState> {
        self.transfers.get(sender_id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
