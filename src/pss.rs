//! Persistent Raft state store collaborator contract (spec §2.1, §3).

use crate::error::RaftError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// The durable singleton record spec §3 calls the PSS: `currentTerm`,
/// `votedFor`, `votedForTerm`, `lastApplied`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u32,
    pub voted_for: Option<String>,
    pub voted_for_term: u32,
    pub last_applied: u64,
}

/// A single-record store for [`PersistentState`] (spec §6 "State machine →
/// PSS"). Writes through this trait must happen in the same backend
/// transaction as the log write and the state-machine mutation they
/// accompany (spec §3 "Persistent Raft state") — this crate enforces that by
/// having the applier and the commit hook call `store` from within their own
/// single backend-transaction boundary, never concurrently with each other.
#[async_trait]
pub trait PersistentStateStore: Send + Sync {
    async fn load(&self) -> Result<PersistentState, RaftError>;
    async fn store(&self, state: PersistentState) -> Result<(), RaftError>;
}

/// An in-memory [`PersistentStateStore`] for tests and the demo binary.
#[derive(Default)]
pub struct MemoryPss {
    state: Mutex<PersistentState>,
}

impl MemoryPss {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStateStore for MemoryPss {
    async fn load(&self) -> Result<PersistentState, RaftError> {
        Ok(self.state.lock().await.clone())
    }

    async fn store(&self, state: PersistentState) -> Result<(), RaftError> {
        *self.state.lock().await = state;
        Ok(())
    }
}
