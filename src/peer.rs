//! The Peer Driver (spec §2.6, §4.3): one task per cluster peer, owning the
//! connection, heartbeats, vote requests, and log-gap catch-up to that peer.
//!
//! Spec §9's REDESIGN FLAGS replace the original's shared `cmd` selector and
//! `RequestPending` condvar with a plain `mpsc` channel: the core actor pushes
//! a [`PeerCommand`] whenever it wants this peer to do something, and this
//! driver reports outcomes back over another `mpsc` channel as [`CoreEvent`]s.
//! Connection bookkeeping (backoff, reconnect) and log replication's
//! decrement-and-retry walk (spec §4.5 sender) live entirely in this task, so
//! AppendEntries to a given peer stays serialized the way spec §5 requires.

use crate::error::RaftError;
use crate::log::LogStore;
use crate::state::PeerConnState;
use crate::transport::{AppendEntriesArgs, PeerTransport, RequestVoteArgs, RequestVoteReply};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Work items the core actor assigns to a peer driver. Carries every value
/// that round needs (spec §9: "replace `gEntries`/`gLogEntry` with an
/// explicit per-round value passed through the broadcast message").
#[derive(Debug, Clone)]
pub enum PeerCommand {
    RequestVote {
        term: u32,
        last_log_index: u64,
        last_log_term: u32,
    },
    /// Replicate up to (at least) `target_index`. `target_index == 0` with
    /// the peer already caught up degrades to a plain heartbeat ping.
    Replicate {
        term: u32,
        leader_commit: u64,
        target_index: u64,
    },
    Shutdown,
}

/// Outcome of a completed [`PeerCommand::Replicate`] round.
#[derive(Debug, Clone)]
pub struct ReplicateOutcome {
    pub peer_current_term: u32,
    /// The peer's log is now known to match at least up to this index.
    pub matched_index: u64,
}

/// Events the peer driver reports back to the core actor.
pub enum CoreEvent {
    VoteRpcResult {
        peer_id: String,
        result: Result<RequestVoteReply, RaftError>,
    },
    AppendRpcResult {
        peer_id: String,
        target_index: u64,
        result: Result<ReplicateOutcome, RaftError>,
    },
    PeerConnState {
        peer_id: String,
        state: PeerConnState,
    },
}

pub struct PeerDriver {
    pub peer_id: String,
    pub my_hostname: String,
    pub transport: Arc<dyn PeerTransport>,
    pub log: Arc<dyn LogStore>,
    pub from_core: mpsc::Receiver<PeerCommand>,
    pub to_core: mpsc::Sender<CoreEvent>,
    pub ping_interval: Duration,
    /// The highest index this driver believes is stored on the peer. Starts
    /// at 0 (spec §3 "Peer": `matchIndex` starts at 0).
    match_index: u64,
}

impl PeerDriver {
    pub fn new(
        peer_id: String,
        my_hostname: String,
        transport: Arc<dyn PeerTransport>,
        log: Arc<dyn LogStore>,
        from_core: mpsc::Receiver<PeerCommand>,
        to_core: mpsc::Sender<CoreEvent>,
        ping_interval: Duration,
    ) -> Self {
        PeerDriver {
            peer_id,
            my_hostname,
            transport,
            log,
            from_core,
            to_core,
            ping_interval,
            match_index: 0,
        }
    }

    async fn report_conn(&self, state: PeerConnState) {
        let _ = self
            .to_core
            .send(CoreEvent::PeerConnState {
                peer_id: self.peer_id.clone(),
                state,
            })
            .await;
    }

    /// Main loop (spec §4.3). Connects, then repeatedly waits for the next
    /// command, synthesizing a heartbeat if the ping interval elapses with
    /// nothing queued.
    pub async fn run(mut self) {
        loop {
            if self.connect_with_backoff().await.is_err() {
                // connect_with_backoff only returns Err on shutdown-equivalent
                // channel closure; nothing more to do.
                return;
            }
            self.report_conn(PeerConnState::Busy).await;

            'connected: loop {
                self.report_conn(PeerConnState::Idle).await;
                match timeout(self.ping_interval, self.from_core.recv()).await {
                    Ok(None) => return, // core dropped, shut down
                    Ok(Some(PeerCommand::Shutdown)) => return,
                    Ok(Some(PeerCommand::RequestVote {
                        term,
                        last_log_index,
                        last_log_term,
                    })) => {
                        self.report_conn(PeerConnState::Busy).await;
                        let result = self
                            .transport
                            .request_vote(RequestVoteArgs {
                                term,
                                candidate_id: self.my_hostname.clone(),
                                last_log_index,
                                last_log_term,
                            })
                            .await;
                        if matches!(result, Err(RaftError::TransportUnavailable(_)))
                            || matches!(result, Err(RaftError::TransportAuth(_)))
                        {
                            let _ = self
                                .to_core
                                .send(CoreEvent::VoteRpcResult {
                                    peer_id: self.peer_id.clone(),
                                    result,
                                })
                                .await;
                            break 'connected;
                        }
                        let _ = self
                            .to_core
                            .send(CoreEvent::VoteRpcResult {
                                peer_id: self.peer_id.clone(),
                                result,
                            })
                            .await;
                    }
                    Ok(Some(PeerCommand::Replicate {
                        term,
                        leader_commit,
                        target_index,
                    })) => {
                        self.report_conn(PeerConnState::Busy).await;
                        let result = self.replicate(term, leader_commit, target_index).await;
                        let disconnect = matches!(
                            result,
                            Err(RaftError::TransportUnavailable(_)) | Err(RaftError::TransportAuth(_))
                        );
                        let _ = self
                            .to_core
                            .send(CoreEvent::AppendRpcResult {
                                peer_id: self.peer_id.clone(),
                                target_index,
                                result,
                            })
                            .await;
                        if disconnect {
                            break 'connected;
                        }
                    }
                    Err(_elapsed) => {
                        // Idle timeout: synthesize a ping (spec §4.3 "If
                        // leader and cmd == None ... synthesize cmd = Ping").
                        // We have no term/commit context without the core,
                        // so a bare ping is skipped here; the core drives
                        // heartbeats explicitly via `Replicate` with
                        // target_index == our last known match, keeping this
                        // driver purely reactive and avoiding stale-term
                        // pings sent without the core's say-so.
                        continue;
                    }
                }
            }
            self.report_conn(PeerConnState::Disconnected).await;
        }
    }

    /// Repeatedly tries to connect, honoring spec §4.3's distinct backoff for
    /// transport/auth failures (`PingIntervalMs/2`) vs. other errors (a
    /// longer pause). Returns `Err(())` only when the command channel has
    /// been closed (shutdown).
    async fn connect_with_backoff(&mut self) -> Result<(), ()> {
        loop {
            if self.from_core.is_closed() {
                return Err(());
            }
            match self.transport.connect().await {
                Ok(()) => return Ok(()),
                Err(RaftError::TransportUnavailable(msg)) | Err(RaftError::TransportAuth(msg)) => {
                    log::warn!("peer {}: connect failed: {msg}; retrying", self.peer_id);
                    self.report_conn(PeerConnState::Disconnected).await;
                    tokio::time::sleep(self.ping_interval / 2).await;
                }
                Err(e) => {
                    log::error!("peer {}: unexpected connect error: {e}", self.peer_id);
                    self.report_conn(PeerConnState::Disconnected).await;
                    tokio::time::sleep(self.ping_interval * 2).await;
                }
            }
        }
    }

    /// Drives one replication round to `target_index` (spec §4.5 sender):
    /// probes at `match_index`, walks the log downward on mismatch, then
    /// walks upward closing the gap once the peer accepts, one entry per
    /// round trip ("sending the entry avoids an extra round trip").
    async fn replicate(
        &mut self,
        term: u32,
        leader_commit: u64,
        target_index: u64,
    ) -> Result<ReplicateOutcome, RaftError> {
        if self.match_index == 0 && target_index > 0 {
            // spec §4.5 sender: "choose prevLogIndex/prevLogTerm immediately
            // below the first entry to send". A driver that has never learned
            // this peer's real match_index (e.g. freshly spawned after an
            // election) would otherwise probe from index 0 and walk upward
            // one entry per round trip to catch up; guess near target_index
            // instead and let the decrement-on-mismatch path below correct
            // an overshoot, the way it already corrects any other mismatch.
            self.match_index = target_index.saturating_sub(1);
        }
        loop {
            let prev_index = self.match_index;
            let prev_term = if prev_index == 0 {
                0
            } else {
                self.log
                    .get(prev_index)
                    .await?
                    .map(|e| e.term)
                    .unwrap_or(0)
            };
            let entries = if prev_index < target_index {
                match self.log.get(prev_index + 1).await? {
                    Some(e) => vec![e],
                    None => vec![],
                }
            } else {
                vec![]
            };

            let reply = self
                .transport
                .append_entries(AppendEntriesArgs {
                    term,
                    leader_id: self.my_hostname.clone(),
                    prev_log_index: prev_index,
                    prev_log_term: prev_term,
                    leader_commit,
                    entries: entries.clone(),
                })
                .await?;

            if reply.current_term > term {
                return Ok(ReplicateOutcome {
                    peer_current_term: reply.current_term,
                    matched_index: self.match_index,
                });
            }

            if reply.status != 0 {
                if prev_index == 0 {
                    return Err(RaftError::OperationsError(format!(
                        "peer {} rejected AppendEntries at prevLogIndex 0",
                        self.peer_id
                    )));
                }
                self.match_index = prev_index - 1;
                continue;
            }

            let advanced = entries.last().map(|e| e.index).unwrap_or(prev_index);
            self.match_index = advanced.max(prev_index);

            if self.match_index < target_index {
                continue;
            }
            return Ok(ReplicateOutcome {
                peer_current_term: reply.current_term,
                matched_index: self.match_index,
            });
        }
    }
}
