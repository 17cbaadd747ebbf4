//! Error kinds surfaced by the replication engine (spec §7).

use thiserror::Error;

/// Errors the engine can return to its callers (the directory layer) or
/// internally between its own tasks.
///
/// Transport-level kinds are normally recovered by the peer driver itself
/// (reconnect loop) and never escape to the public API; they are part of
/// this enum because the peer driver and the core actor communicate using
/// it too.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// The peer connection could not be established or was lost mid-call.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The peer rejected our credentials or the auth handshake failed.
    #[error("transport auth failed: {0}")]
    TransportAuth(String),

    /// Transient: not enough peers are Idle yet to start a vote or a commit.
    #[error("peer not ready")]
    PeerNotReady,

    /// An invariant that should always hold was violated (e.g. the local log
    /// is missing an index the leader's state says must exist). Logged and
    /// the affected RPC cycle is aborted; never fatal to the process.
    #[error("operations error: {0}")]
    OperationsError(String),

    /// The commit hook could not reach a majority within the consensus
    /// timeout; the caller's write transaction must abort.
    #[error("insufficient quorum to commit")]
    InsufficientQuorum,

    /// The node is tearing down; in-flight operations should stop cleanly.
    #[error("shutting down")]
    ShuttingDown,

    /// A caller-supplied parameter (configuration, RPC argument) is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// This node is not the leader and cannot accept writes.
    #[error("unwilling to perform: not the leader")]
    UnwillingToPerform,
}

pub type RaftResult<T> = Result<T, RaftError>;
