//! In-memory authoritative Raft state (spec §2.4, §3 Invariants).
//!
//! This lives entirely inside the [`crate::core::RaftCore`] actor's task; no
//! other task ever touches it directly. That is the redesign spec §9 asks
//! for: the single coarse mutex of the original implementation becomes one
//! actor's private state, and the five condition variables become channel
//! sends into and out of that actor (see `crate::core`).

use std::collections::HashMap;
use std::time::Instant;

/// A node's role in the cluster (spec §2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    /// `transitioning` is true while commit-catch-up (spec §4.6) is running
    /// after winning an election; `disallow_updates()` reads this instead of
    /// a separate global flag (spec §9 design note on `disallowUpdates`).
    Leader { transitioning: bool },
    Candidate,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    pub fn disallows_updates(&self) -> bool {
        matches!(self, Role::Leader { transitioning: true })
    }
}

/// Connection/availability state of one peer, from this node's point of view
/// (spec §3 "Peer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnState {
    PendingAdd,
    Idle,
    Busy,
    Disconnected,
}

/// Everything the core actor tracks about one peer (spec §3 "Peer").
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub match_index: u64,
    pub conn_state: PeerConnState,
    /// Per-round flag the leader uses to count quorum for the entry
    /// currently replicating (spec §3 `bLogReplicated`).
    pub log_replicated_this_round: bool,
    pub is_deleted: bool,
}

impl PeerRecord {
    pub fn new() -> Self {
        PeerRecord {
            match_index: 0,
            conn_state: PeerConnState::PendingAdd,
            log_replicated_this_round: false,
            is_deleted: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.conn_state, PeerConnState::Idle)
    }
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative in-memory state spec §2.4 names (not the PSS, which is
/// durable; `current_term`/`voted_for` are mirrored here for fast reads but
/// every mutation is written through [`crate::pss::PersistentStateStore`]
/// first).
pub struct RaftState {
    pub role: Role,
    pub current_term: u32,
    pub voted_for: Option<String>,
    pub voted_for_term: u32,

    pub commit_index: u64,
    pub commit_index_term: u32,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u32,

    /// `1 + peers.len()` once membership has settled (spec §4.8).
    pub cluster_size: usize,
    pub peers: HashMap<String, PeerRecord>,

    pub leader_hint: Option<String>,

    pub last_ping_recv_time: Instant,

    /// Tracks a vote round in progress.
    pub vote_consensus_term: u32,
    pub vote_consensus_count: usize,
    pub vote_denied_count: usize,

    /// False until [`crate::core::RaftCore::new`] has finished loading
    /// persisted term/vote state; gates [`crate::core::RaftCore`]'s
    /// `RequestVote` receiver (spec §4.4).
    pub initialized: bool,
}

impl RaftState {
    pub fn new(initial_peers: &[String]) -> Self {
        let mut peers = HashMap::new();
        for p in initial_peers {
            peers.insert(p.clone(), PeerRecord::new());
        }
        RaftState {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            voted_for_term: 0,
            commit_index: 0,
            commit_index_term: 0,
            last_applied: 0,
            last_log_index: 0,
            last_log_term: 0,
            cluster_size: 1 + peers.len(),
            peers,
            leader_hint: None,
            last_ping_recv_time: Instant::now(),
            vote_consensus_term: 0,
            vote_consensus_count: 0,
            vote_denied_count: 0,
            initialized: false,
        }
    }

    pub fn idle_peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_idle() && !p.is_deleted).count()
    }

    pub fn active_peer_count(&self) -> usize {
        self.peers.values().filter(|p| !p.is_deleted).count()
    }
}

/// A read-only, cheaply-cloneable view of [`RaftState`] published by the core
/// actor so that [`crate::handle::RaftHandle`] callers (`DisallowUpdates`,
/// `GetLeader`, `NeedReferral`) never have to round-trip through the actor's
/// message channel for a cheap query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftSnapshot {
    pub role_is_leader: bool,
    pub role_is_follower: bool,
    pub disallow_updates: bool,
    pub leader_hint: Option<String>,
    pub current_term: u32,
    pub commit_index: u64,
    pub last_applied: u64,
}

impl From<&RaftState> for RaftSnapshot {
    fn from(s: &RaftState) -> Self {
        RaftSnapshot {
            role_is_leader: s.role.is_leader(),
            role_is_follower: matches!(s.role, Role::Follower),
            disallow_updates: s.role.disallows_updates(),
            leader_hint: s.leader_hint.clone(),
            current_term: s.current_term,
            commit_index: s.commit_index,
            last_applied: s.last_applied,
        }
    }
}
