//! State Machine Applier (spec §4.7): decodes a committed log entry, commits
//! it against the directory backend in one transaction alongside the
//! `lastApplied` watermark, then runs post-commit plugins best-effort and
//! reports any membership-relevant mutation back to the core actor.

use crate::error::RaftError;
use crate::log::{LogEntry, RequestCode};
use crate::pss::PersistentStateStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Directory payload carried by `Add`/`Delete` entries (spec §3 "Log entry").
/// `Modify` entries carry an opaque attribute-modification blob this crate
/// never inspects, since only Add/Delete of a peer's computer account are
/// membership-relevant (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryWrite {
    pub dn: String,
    /// `Some((peer_id, dial_address))` when this write targets a peer
    /// computer account; `None` for an ordinary directory object.
    pub peer_account: Option<(String, String)>,
}

/// A membership-relevant side effect of applying one entry, surfaced to the
/// core actor so it can spin up or tear down a [`crate::peer::PeerDriver`]
/// (spec §4.8 "membership changes are driven only by committed log entries").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add { peer_id: String, address: String },
    Remove { peer_id: String },
}

/// The directory backend collaborator (spec §2.1 "state machine backend",
/// §6 "State machine"). `apply_*` must commit the mutation and the updated
/// `last_applied` watermark in a single backend transaction (spec §3
/// "Persistent Raft state"); this crate enforces that by calling
/// [`PersistentStateStore::store`] from inside [`Applier::apply`], never
/// concurrently with the commit hook's own PSS writes.
#[async_trait]
pub trait StateMachineBackend: Send + Sync {
    async fn apply_add(&self, entry_id: u64, write: &DirectoryWrite) -> Result<(), RaftError>;
    async fn apply_modify(&self, entry_id: u64, modifications: &[u8]) -> Result<(), RaftError>;
    async fn apply_delete(&self, entry_id: u64, write: &DirectoryWrite) -> Result<(), RaftError>;

    /// Fired after the transaction above has committed. Best-effort: a
    /// plugin failure is logged and otherwise ignored (spec §4.7).
    async fn run_post_commit_plugins(&self, entry: &LogEntry);
}

pub struct Applier {
    backend: Arc<dyn StateMachineBackend>,
    pss: Arc<dyn PersistentStateStore>,
    own_hostname: String,
}

impl Applier {
    pub fn new(
        backend: Arc<dyn StateMachineBackend>,
        pss: Arc<dyn PersistentStateStore>,
        own_hostname: impl Into<String>,
    ) -> Self {
        Applier {
            backend,
            pss,
            own_hostname: own_hostname.into(),
        }
    }

    /// Applies one committed entry and advances `lastApplied` in the PSS.
    /// Rejects deletion of this node's own computer account (spec §4.8).
    pub async fn apply(&self, entry: &LogEntry) -> Result<Option<MembershipChange>, RaftError> {
        let membership_change = match entry.request_code {
            RequestCode::Add => {
                let write: DirectoryWrite = decode_directory_write(&entry.payload)?;
                self.backend.apply_add(entry.entry_id, &write).await?;
                write
                    .peer_account
                    .map(|(peer_id, address)| MembershipChange::Add { peer_id, address })
            }
            RequestCode::Modify => {
                self.backend
                    .apply_modify(entry.entry_id, &entry.payload)
                    .await?;
                None
            }
            RequestCode::Delete => {
                let write: DirectoryWrite = decode_directory_write(&entry.payload)?;
                if let Some((peer_id, _)) = &write.peer_account {
                    if *peer_id == self.own_hostname {
                        return Err(RaftError::InvalidParameter(
                            "refusing to delete this node's own computer account".into(),
                        ));
                    }
                }
                self.backend.apply_delete(entry.entry_id, &write).await?;
                write
                    .peer_account
                    .map(|(peer_id, _)| MembershipChange::Remove { peer_id })
            }
        };

        let mut pss_state = self.pss.load().await?;
        pss_state.last_applied = entry.index;
        self.pss.store(pss_state).await?;

        self.backend.run_post_commit_plugins(entry).await;

        Ok(membership_change)
    }
}

fn decode_directory_write(payload: &[u8]) -> Result<DirectoryWrite, RaftError> {
    bincode::deserialize(payload)
        .map_err(|e| RaftError::OperationsError(format!("directory write decode failed: {e}")))
}

/// An in-memory [`StateMachineBackend`] for tests and the demo binary: keeps
/// applied DNs in a set and records delete/plugin calls, without modeling a
/// real LDAP-style object store.
#[derive(Default)]
pub struct MemoryBackend {
    applied: tokio::sync::Mutex<std::collections::HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, dn: &str) -> bool {
        self.applied.lock().await.contains(dn)
    }
}

#[async_trait]
impl StateMachineBackend for MemoryBackend {
    async fn apply_add(&self, _entry_id: u64, write: &DirectoryWrite) -> Result<(), RaftError> {
        self.applied.lock().await.insert(write.dn.clone());
        Ok(())
    }

    async fn apply_modify(&self, _entry_id: u64, _modifications: &[u8]) -> Result<(), RaftError> {
        Ok(())
    }

    async fn apply_delete(&self, _entry_id: u64, write: &DirectoryWrite) -> Result<(), RaftError> {
        self.applied.lock().await.remove(&write.dn);
        Ok(())
    }

    async fn run_post_commit_plugins(&self, _entry: &LogEntry) {}
}
