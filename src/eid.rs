//! Entry-ID allocation (spec §4.9), grounded in
//! `examples/original_source/lwraft/server/replication/thread.c`,
//! `VmDirRaftNextNewEntryId` (line ~2288, `*pEntryId = NEW_ENTRY_EID_PREFIX |
//! (gRaftState.commitIndex + 1)`) and `VmDirRaftLogIndexToCommit` (line
//! ~2298, the `idxMajor` counter that resets whenever `commitIndex` differs
//! from the previous call and otherwise increments, to disambiguate more than
//! one LDAP Add within the same not-yet-committed MDB transaction): a
//! candidate entry ID is synthesized from the *next* commit index so a leader
//! can hand a caller an ID before the write has actually been proposed,
//! without two callers racing onto the same ID within one commit round. The
//! original packs `idxMajor` into the high bits and `commitIndex + 1` into
//! the low bits of a *separate* value from the `NEW_ENTRY_EID_PREFIX`-tagged
//! one `VmDirRaftNextNewEntryId` returns; this crate instead combines all
//! three (`NEW_ENTRY_EID_PREFIX`, `commitIndex + 1`, `idxMajor`) into one
//! value below, since this crate has no second call site that needs the
//! untagged form.

use tokio::sync::Mutex;

/// High bit reserved so a synthesized ID can never collide with an ID a
/// commit has already assigned through the normal allocation path.
const NEW_ENTRY_EID_PREFIX: u64 = 1 << 63;

struct EidState {
    last_commit_index_seen: u64,
    idx_major: u32,
}

/// Allocates candidate entry IDs for not-yet-proposed writes.
///
/// The ID is `NEW_ENTRY_EID_PREFIX | ((commitIndex + 1) << 32) | idxMajor`.
/// `idxMajor` disambiguates multiple callers racing to draft an entry against
/// the same future commit index; it resets to zero whenever `commitIndex`
/// itself advances, since a new commit round means any previously-handed-out
/// candidate ID for the old round is now stale.
pub struct EidAllocator {
    state: Mutex<EidState>,
}

impl EidAllocator {
    pub fn new() -> Self {
        EidAllocator {
            state: Mutex::new(EidState {
                last_commit_index_seen: 0,
                idx_major: 0,
            }),
        }
    }

    /// `commit_index` is the engine's current commit index; the returned ID
    /// is a candidate for the entry that would land at `commit_index + 1`.
    pub async fn next_new_entry_id(&self, commit_index: u64) -> u64 {
        let mut state = self.state.lock().await;
        if commit_index != state.last_commit_index_seen {
            state.last_commit_index_seen = commit_index;
            state.idx_major = 0;
        } else {
            state.idx_major = state.idx_major.wrapping_add(1);
        }
        NEW_ENTRY_EID_PREFIX | ((commit_index + 1) << 32) | state.idx_major as u64
    }
}

impl Default for EidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
