//! Cluster configuration and timeout validation (spec §5, §6).

use crate::error::RaftError;
use std::time::Duration;

/// Timeouts and identity for one node in the cluster.
///
/// All durations are milliseconds on the wire/config layer (matching the
/// `RaftPingIntervalMS` / `RaftElectionTimeoutMS`-style names in spec §6) but
/// are stored here as `Duration` so the rest of the crate never has to
/// remember the unit.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's identity, used as `candidateId` / `leaderId` on the wire.
    pub hostname: String,
    /// Addresses of the other cluster members this node should dial.
    pub peers: Vec<String>,

    pub ping_interval: Duration,
    pub election_timeout: Duration,
    pub wait_consensus_timeout: Duration,
    pub wait_peers_ready_timeout: Duration,
    pub reelection_rand: Duration,
}

impl RaftConfig {
    /// Builds a config from millisecond values, the unit spec §6 uses.
    pub fn from_millis(
        hostname: impl Into<String>,
        peers: Vec<String>,
        ping_interval_ms: u64,
        election_timeout_ms: u64,
        wait_consensus_timeout_ms: u64,
        wait_peers_ready_timeout_ms: u64,
        reelection_rand_ms: u64,
    ) -> Result<Self, RaftError> {
        let cfg = RaftConfig {
            hostname: hostname.into(),
            peers,
            ping_interval: Duration::from_millis(ping_interval_ms),
            election_timeout: Duration::from_millis(election_timeout_ms),
            wait_consensus_timeout: Duration::from_millis(wait_consensus_timeout_ms),
            wait_peers_ready_timeout: Duration::from_millis(wait_peers_ready_timeout_ms),
            reelection_rand: Duration::from_millis(reelection_rand_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the relationship spec §5 requires:
    /// `ElectionTimeoutMs > 2 * PingIntervalMs`, `ElectionTimeoutMs >= 10`,
    /// `PingIntervalMs >= 20`.
    pub fn validate(&self) -> Result<(), RaftError> {
        let ping_ms = self.ping_interval.as_millis();
        let election_ms = self.election_timeout.as_millis();

        if election_ms < 10 {
            return Err(RaftError::InvalidParameter(format!(
                "election_timeout ({election_ms}ms) must be >= 10ms"
            )));
        }
        if ping_ms < 20 {
            return Err(RaftError::InvalidParameter(format!(
                "ping_interval ({ping_ms}ms) must be >= 20ms"
            )));
        }
        if election_ms <= ping_ms * 2 {
            return Err(RaftError::InvalidParameter(format!(
                "election_timeout ({election_ms}ms) must be greater than twice ping_interval ({ping_ms}ms)"
            )));
        }
        Ok(())
    }

    /// `⌊clusterSize/2⌋ + 1`, spec GLOSSARY "Quorum".
    pub fn quorum(cluster_size: usize) -> usize {
        cluster_size / 2 + 1
    }

    /// The number of *other* peers that must be Idle before a vote or commit
    /// round can start. Spec §9 Open Question (c): kept as integer floor of
    /// `clusterSize/2`, so a 4-node cluster needs 2 Idle peers (see DESIGN.md).
    pub fn idle_quorum(cluster_size: usize) -> usize {
        cluster_size / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_election_timeout_not_greater_than_twice_ping() {
        let err = RaftConfig::from_millis("me", vec![], 100, 150, 500, 500, 100).unwrap_err();
        assert!(matches!(err, RaftError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_ping_interval_below_floor() {
        let err = RaftConfig::from_millis("me", vec![], 10, 200, 500, 500, 100).unwrap_err();
        assert!(matches!(err, RaftError::InvalidParameter(_)));
    }

    #[test]
    fn accepts_well_formed_config() {
        let cfg = RaftConfig::from_millis("me", vec![], 75, 300, 1000, 1000, 150).unwrap();
        assert_eq!(cfg.ping_interval, Duration::from_millis(75));
    }

    #[test]
    fn quorum_and_idle_quorum_match_spec_floor() {
        assert_eq!(RaftConfig::quorum(3), 2);
        assert_eq!(RaftConfig::quorum(4), 3);
        assert_eq!(RaftConfig::idle_quorum(4), 2);
        assert_eq!(RaftConfig::idle_quorum(3), 1);
    }
}
