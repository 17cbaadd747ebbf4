//! Membership Reconciler (spec §4.8): the startup scan of peer computer
//! accounts that seeds `clusterSize`, and the guard that keeps membership
//! changes flowing only through committed log entries rather than a
//! side-channel `AddPeer`/`RemovePeer` call.

use crate::error::RaftError;
use async_trait::async_trait;

/// Looks up the directory's own notion of peer computer accounts. A real
/// deployment backs this with the same directory backend `StateMachineBackend`
/// mutates; the demo binary and tests use a static list instead.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Returns `(peer_id, dial_address)` for every peer computer account
    /// known at startup (spec §4.8 "startup scan").
    async fn scan_peer_accounts(&self) -> Result<Vec<(String, String)>, RaftError>;
}

/// `clusterSize = 1 + peerCount` (spec §4.8).
pub fn cluster_size(peer_count: usize) -> usize {
    1 + peer_count
}

/// Rejects a membership change that would remove this node's own account.
/// Entry-level enforcement lives in [`crate::applier::Applier::apply`]; this
/// is the narrower check the core actor runs before it ever tears down its
/// own peer bookkeeping in response to a `MembershipChange`.
pub fn reject_self_removal(own_hostname: &str, peer_id: &str) -> Result<(), RaftError> {
    if own_hostname == peer_id {
        return Err(RaftError::InvalidParameter(
            "refusing to remove this node's own membership entry".into(),
        ));
    }
    Ok(())
}

/// A fixed peer list, for the demo binary and for tests where directory
/// lookup isn't the thing under test.
pub struct StaticPeerDirectory {
    peers: Vec<(String, String)>,
}

impl StaticPeerDirectory {
    pub fn new(peers: Vec<(String, String)>) -> Self {
        StaticPeerDirectory { peers }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn scan_peer_accounts(&self) -> Result<Vec<(String, String)>, RaftError> {
        Ok(self.peers.clone())
    }
}
