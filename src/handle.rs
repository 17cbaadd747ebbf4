//! The public engine API (spec §6 "Public engine API"): the narrow surface
//! handed up to the directory layer. Callers never see [`crate::core::RaftCore`]
//! or [`crate::state::RaftState`] directly — only this handle, its snapshot
//! queries, and the commit round-trip.

use crate::core::CoreHandle;
use crate::eid::EidAllocator;
use crate::error::RaftError;
use crate::log::{LogEntry, RequestCode};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// The DN suffix carved out for Raft's own state/log entries. `need_referral`
/// never sends a client here even when this node is a Follower, mirroring
/// `VmDirRaftNeedReferral`'s `RAFT_CONTEXT_DN` carve-out in
/// `examples/original_source/lwraft/server/replication/thread.c`.
pub const RAFT_CONTEXT_DN: &str = "cn=raftcontext";

/// Handed to the directory layer in place of the coarse-mutex-guarded global
/// state the original implementation exposed. Cloning is cheap: it's a
/// `CoreHandle` (an mpsc sender + a watch receiver) plus an index-assignment
/// mutex and the entry-id allocator.
#[derive(Clone)]
pub struct RaftHandle {
    core: CoreHandle,
    eid_allocator: Arc<EidAllocator>,
    /// Serializes "read current commit index, draft the next entry, submit
    /// it" the way the real backend's own transaction mutex serializes
    /// concurrent writers onto the same next log index (spec §4.9 design
    /// note: "thread-safe by construction because allocation happens only on
    /// the leader's single backend write path").
    draft_lock: Arc<AsyncMutex<()>>,
}

impl RaftHandle {
    pub fn new(core: CoreHandle, eid_allocator: Arc<EidAllocator>) -> Self {
        RaftHandle {
            core,
            eid_allocator,
            draft_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// `NextNewEntryId(&out)` (spec §4.9): a candidate entry ID for an Add
    /// the caller is about to draft, ahead of the write actually being
    /// proposed.
    pub async fn next_new_entry_id(&self) -> u64 {
        let commit_index = self.core.snapshot().commit_index;
        self.eid_allocator.next_new_entry_id(commit_index).await
    }

    /// `PreCommitAdd(payload)` (spec §6): drafts a log entry at
    /// `commitIndex + 1` carrying the encoded entry and invokes the Commit
    /// Hook. `entry_id` is whatever [`RaftHandle::next_new_entry_id`]
    /// previously returned for this write.
    pub async fn pre_commit_add(&self, entry_id: u64, payload: Vec<u8>) -> Result<(), RaftError> {
        self.pre_commit(entry_id, RequestCode::Add, payload).await
    }

    /// `PreCommitModify(payload)` (spec §6): `entry_id` identifies the
    /// existing target object; `payload` is the encoded modification list.
    pub async fn pre_commit_modify(
        &self,
        entry_id: u64,
        payload: Vec<u8>,
    ) -> Result<(), RaftError> {
        self.pre_commit(entry_id, RequestCode::Modify, payload).await
    }

    /// `PreCommitDelete(payload)` (spec §6): `payload` is always empty for a
    /// Delete (spec §3 "Log entry").
    pub async fn pre_commit_delete(&self, entry_id: u64) -> Result<(), RaftError> {
        self.pre_commit(entry_id, RequestCode::Delete, Vec::new()).await
    }

    async fn pre_commit(
        &self,
        entry_id: u64,
        request_code: RequestCode,
        payload: Vec<u8>,
    ) -> Result<(), RaftError> {
        let _guard = self.draft_lock.lock().await;
        let snapshot = self.core.snapshot();
        let entry = LogEntry {
            index: snapshot.commit_index + 1,
            term: snapshot.current_term,
            entry_id,
            request_code,
            payload,
        };
        self.core.commit(entry).await
    }

    /// A PSS-only mutation (no replicable payload) — spec §4.6 "`gLogEntry.index
    /// == 0` ⇒ transaction has no replicable payload; return success" without
    /// a round-trip through the core actor.
    pub async fn pre_commit_local_only(&self) -> Result<(), RaftError> {
        self.core.commit(LogEntry::none()).await
    }

    /// `DisallowUpdates()` (spec §6): true while a just-elected leader is
    /// still running commit-catch-up (spec §4.6).
    pub fn disallow_updates(&self) -> bool {
        self.core.snapshot().disallow_updates
    }

    /// `GetLeader()` (spec §6): the current leader hint, when known.
    pub fn get_leader(&self) -> Option<String> {
        self.core.snapshot().leader_hint
    }

    /// `NeedReferral(requestDn)` (spec §6): true when this node is a Follower
    /// and `request_dn` is outside the Raft state subtree, mirroring
    /// `VmDirRaftNeedReferral`'s carve-out for `RAFT_CONTEXT_DN`.
    pub fn need_referral(&self, request_dn: &str) -> bool {
        if request_dn.is_empty() {
            return false;
        }
        if request_dn.to_ascii_lowercase().ends_with(&RAFT_CONTEXT_DN.to_ascii_lowercase()) {
            return false;
        }
        self.core.snapshot().role_is_follower
    }
}
