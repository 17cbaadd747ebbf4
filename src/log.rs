//! Log entries, the wire codec, and the `LogStore` collaborator contract
//! (spec §2.1 "Log Codec", §3 "Log entry").

use crate::error::RaftError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The kind of directory write a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCode {
    Add,
    Modify,
    Delete,
}

/// An immutable, once-persisted log entry (spec §3 "Log entry").
///
/// `index` is unsigned 64-bit and strictly increasing with no gaps; `term`
/// is unsigned 32-bit. `payload` is opaque to this crate: for `Add` it's the
/// encoded entry, for `Modify` the encoded modification list, for `Delete`
/// it's empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u32,
    pub entry_id: u64,
    pub request_code: RequestCode,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// A sentinel used where spec §4.6 says "index == 0 means no replicable
    /// payload" (e.g. a PSS-only update that the commit hook should treat as
    /// an automatic local success).
    pub fn none() -> LogEntry {
        LogEntry {
            index: 0,
            term: 0,
            entry_id: 0,
            request_code: RequestCode::Delete,
            payload: Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.index == 0
    }

    /// Packs the entry into its wire representation (bincode, matching the
    /// teacher's `bincode::serialize` use for on-disk/on-wire state).
    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        bincode::serialize(self)
            .map_err(|e| RaftError::OperationsError(format!("log entry encode failed: {e}")))
    }

    /// Unpacks a wire representation produced by [`LogEntry::encode`].
    pub fn decode(bytes: &[u8]) -> Result<LogEntry, RaftError> {
        bincode::deserialize(bytes)
            .map_err(|e| RaftError::OperationsError(format!("log entry decode failed: {e}")))
    }
}

/// Durable, append-only storage for the log (spec §2.1 "Persistent State
/// Store"). Implementations must be gap-free and strictly increasing in
/// `index` (spec §3 Invariants); this crate never writes through this trait
/// while holding the core actor's state lock (spec §5).
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Appends `entry` to the log. Callers guarantee `entry.index` is exactly
    /// one greater than the current last index, except when truncating first.
    async fn append(&self, entry: LogEntry) -> Result<(), RaftError>;

    /// Deletes all entries with `index >= from_index`. Used only by followers
    /// discarding an uncommitted divergent tail (spec §4.5 receiver).
    async fn truncate_from(&self, from_index: u64) -> Result<(), RaftError>;

    /// Fetches the entry at `index`, if present.
    async fn get(&self, index: u64) -> Result<Option<LogEntry>, RaftError>;

    /// Returns `(lastLogIndex, lastLogTerm)`, `(0, 0)` for an empty log.
    async fn last(&self) -> Result<(u64, u32), RaftError>;
}

/// An in-memory [`LogStore`] used by tests and the demo binary. Never use in
/// a real deployment: it loses the log on process exit, violating spec §8
/// Durability.
#[derive(Default)]
pub struct MemoryLog {
    entries: tokio::sync::Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(&self, entry: LogEntry) -> Result<(), RaftError> {
        let mut entries = self.entries.lock().await;
        if let Some(last) = entries.last() {
            if entry.index != last.index + 1 {
                return Err(RaftError::OperationsError(format!(
                    "log gap: appending index {} after last index {}",
                    entry.index, last.index
                )));
            }
        } else if entry.index != 1 {
            return Err(RaftError::OperationsError(format!(
                "log gap: first entry must be index 1, got {}",
                entry.index
            )));
        }
        entries.push(entry);
        Ok(())
    }

    async fn truncate_from(&self, from_index: u64) -> Result<(), RaftError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.index < from_index);
        Ok(())
    }

    async fn get(&self, index: u64) -> Result<Option<LogEntry>, RaftError> {
        if index == 0 {
            return Ok(None);
        }
        let entries = self.entries.lock().await;
        Ok(entries
            .get((index - 1) as usize)
            .filter(|e| e.index == index)
            .cloned())
    }

    async fn last(&self) -> Result<(u64, u32), RaftError> {
        let entries = self.entries.lock().await;
        Ok(entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0)))
    }
}
