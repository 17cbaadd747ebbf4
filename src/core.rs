//! The `RaftCore` actor (spec §9 REDESIGN FLAGS): owns every mutable field
//! spec §2.4/§3 would otherwise guard with one coarse mutex, and replaces the
//! original's five condition variables with typed messages flowing through
//! `tokio::sync::mpsc`/`oneshot`, plus a `tokio::sync::watch` broadcast of a
//! read-only [`RaftSnapshot`] for cheap synchronous-feeling queries.
//!
//! One actor instance implements, together, the Election Scheduler (§4.2),
//! the RPC receiver-side decision logic (§4.4, §4.5 receiver), and the
//! Commit Hook (§4.6). Sender-side RPC dispatch and per-peer catch-up live in
//! [`crate::peer::PeerDriver`]; this actor only decides *what* each peer
//! should do next and tallies the results.

use crate::applier::{Applier, MembershipChange};
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::{LogEntry, LogStore, RequestCode};
use crate::membership;
use crate::peer::{self, PeerCommand, PeerDriver, ReplicateOutcome};
use crate::pss::PersistentStateStore;
use crate::state::{PeerRecord, RaftSnapshot, RaftState, Role};
use crate::transport::{
    AppendEntriesArgs, AppendEntriesReply, PeerTransport, RequestVoteArgs, RequestVoteReply,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// The human-readable form of the wire's numeric `vote_status` (spec §9 Open
/// Question (b)): the wire struct keeps `0`/`1`/`2` for compatibility, this
/// is what the decision logic actually reasons about.
enum VoteDecision {
    Granted,
    Denied,
    DeniedShorterLog,
}

impl VoteDecision {
    fn to_wire(self) -> u8 {
        match self {
            VoteDecision::Granted => 0,
            VoteDecision::Denied => 1,
            VoteDecision::DeniedShorterLog => 2,
        }
    }
}

struct PendingCommit {
    entry: LogEntry,
    respond_to: oneshot::Sender<Result<(), RaftError>>,
    deadline: Instant,
}

/// A commit request that arrived before a quorum of peers were Idle (spec
/// §4.6: "Wait on `PeersReady` until quorum-1 peers are Idle (bounded
/// retries with `WaitPeersReadyMs`)"). Re-checked every tick in
/// [`RaftCore::on_tick`] until readiness is reached or `deadline` passes.
struct PendingReadyCommit {
    entry: LogEntry,
    respond_to: oneshot::Sender<Result<(), RaftError>>,
    deadline: Instant,
}

struct PendingElection {
    deadline: Instant,
}

/// Tracks a follower's bounded wait for `PeersReady` before it may become a
/// candidate (spec §4.2: "wait on `PeersReady` (bounded by
/// `WaitPeersReadyMs`)"), mirroring [`PendingReadyCommit`]'s bound on the
/// commit path. `started_at` is set the first tick readiness is found
/// lacking and cleared once readiness is reached or the bound elapses.
struct PendingElectionReadiness {
    started_at: Instant,
}

struct PeerHandle {
    to_peer: mpsc::Sender<PeerCommand>,
}

/// Messages the core actor's mailbox accepts. `Peer` wraps everything a
/// [`crate::peer::PeerDriver`] reports; the rest come from the public API
/// ([`crate::handle::RaftHandle`]) or the RPC-serving side of the transport.
pub enum CoreMessage {
    Peer(peer::CoreEvent),
    IncomingRequestVote {
        args: RequestVoteArgs,
        respond_to: oneshot::Sender<RequestVoteReply>,
    },
    IncomingAppendEntries {
        args: AppendEntriesArgs,
        respond_to: oneshot::Sender<AppendEntriesReply>,
    },
    CommitRequest {
        entry: LogEntry,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    },
    Shutdown,
}

/// A cheap, cloneable front door to a running [`RaftCore`]. This is what
/// [`crate::handle::RaftHandle`] and the RPC-serving side of the demo binary
/// hold; none of them ever touch [`RaftState`] directly.
#[derive(Clone)]
pub struct CoreHandle {
    inbox_tx: mpsc::Sender<CoreMessage>,
    snapshot: watch::Receiver<RaftSnapshot>,
}

impl CoreHandle {
    pub fn snapshot(&self) -> RaftSnapshot {
        self.snapshot.borrow().clone()
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inbox_tx
            .send(CoreMessage::IncomingRequestVote { args, respond_to: tx })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inbox_tx
            .send(CoreMessage::IncomingAppendEntries { args, respond_to: tx })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub async fn commit(&self, entry: LogEntry) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inbox_tx
            .send(CoreMessage::CommitRequest { entry, respond_to: tx })
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    pub async fn shutdown(&self) {
        let _ = self.inbox_tx.send(CoreMessage::Shutdown).await;
    }
}

pub struct RaftCore {
    config: RaftConfig,
    state: RaftState,
    log: Arc<dyn LogStore>,
    pss: Arc<dyn PersistentStateStore>,
    applier: Applier,
    transport_factory: Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync>,

    peer_handles: HashMap<String, PeerHandle>,
    inbox: mpsc::Receiver<CoreMessage>,
    inbox_tx: mpsc::Sender<CoreMessage>,
    snapshot_tx: watch::Sender<RaftSnapshot>,

    pending_commit: Option<PendingCommit>,
    pending_ready_commit: Option<PendingReadyCommit>,
    pending_election: Option<PendingElection>,
    pending_election_readiness: Option<PendingElectionReadiness>,
    next_candidate_retry_at: Option<Instant>,
    shutting_down: bool,
}

impl RaftCore {
    /// Builds a core actor around its initial peer list (spec §4.8's startup
    /// scan result) and returns a [`CoreHandle`] for callers alongside the
    /// actor itself, which the caller must hand to `tokio::spawn(core.run())`.
    ///
    /// Restores `currentTerm`/`votedFor`/`votedForTerm`/`lastApplied` from the
    /// PSS and `lastLogIndex`/`lastLogTerm` from the log tail before anything
    /// can reach this actor's mailbox (spec §8 "Monotonic Term" and
    /// "Durability" must hold across a crash-restart, not just within one
    /// process lifetime).
    pub async fn new(
        config: RaftConfig,
        initial_peers: Vec<(String, String)>,
        log: Arc<dyn LogStore>,
        pss: Arc<dyn PersistentStateStore>,
        applier: Applier,
        transport_factory: Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync>,
    ) -> (CoreHandle, RaftCore) {
        let ids: Vec<String> = initial_peers.iter().map(|(id, _)| id.clone()).collect();
        let mut state = RaftState::new(&ids);

        match pss.load().await {
            Ok(persisted) => {
                state.current_term = persisted.current_term;
                state.voted_for = persisted.voted_for;
                state.voted_for_term = persisted.voted_for_term;
                state.last_applied = persisted.last_applied;
            }
            Err(e) => log::error!("failed to load persistent raft state at startup: {e}"),
        }
        match log.last().await {
            Ok((last_index, last_term)) => {
                state.last_log_index = last_index;
                state.last_log_term = last_term;
            }
            Err(e) => log::error!("failed to read log tail at startup: {e}"),
        }
        state.commit_index = state.last_applied;
        state.initialized = true;

        let (inbox_tx, inbox) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(RaftSnapshot::from(&state));

        let mut core = RaftCore {
            config,
            state,
            log,
            pss,
            applier,
            transport_factory,
            peer_handles: HashMap::new(),
            inbox,
            inbox_tx: inbox_tx.clone(),
            snapshot_tx,
            pending_commit: None,
            pending_ready_commit: None,
            pending_election: None,
            pending_election_readiness: None,
            next_candidate_retry_at: None,
            shutting_down: false,
        };
        for (id, addr) in initial_peers {
            core.start_peer_driver(id, addr);
        }
        let handle = CoreHandle {
            inbox_tx,
            snapshot: snapshot_rx,
        };
        (handle, core)
    }

    /// The actor's run loop: a ticker paced at `ping_interval` drives the
    /// Election Scheduler and leader heartbeats; everything else arrives as a
    /// [`CoreMessage`].
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                msg = self.inbox.recv() => {
                    match msg {
                        Some(m) => self.handle_message(m).await,
                        None => break,
                    }
                }
            }
            if self.shutting_down {
                break;
            }
        }
        for (_, handle) in self.peer_handles.drain() {
            let _ = handle.to_peer.send(PeerCommand::Shutdown).await;
        }
    }

    fn start_peer_driver(&mut self, peer_id: String, address: String) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (evt_tx, mut evt_rx) = mpsc::channel::<peer::CoreEvent>(32);
        let inbox_tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = evt_rx.recv().await {
                if inbox_tx.send(CoreMessage::Peer(evt)).await.is_err() {
                    break;
                }
            }
        });

        let transport = (self.transport_factory)(&address);
        let driver = PeerDriver::new(
            peer_id.clone(),
            self.config.hostname.clone(),
            transport,
            self.log.clone(),
            cmd_rx,
            evt_tx,
            self.config.ping_interval,
        );
        tokio::spawn(driver.run());
        self.peer_handles.insert(peer_id, PeerHandle { to_peer: cmd_tx });
    }

    async fn handle_message(&mut self, msg: CoreMessage) {
        match msg {
            CoreMessage::Peer(peer::CoreEvent::VoteRpcResult { peer_id, result }) => {
                self.handle_vote_result(peer_id, result).await;
            }
            CoreMessage::Peer(peer::CoreEvent::AppendRpcResult {
                peer_id,
                target_index,
                result,
            }) => {
                self.handle_append_result(peer_id, target_index, result).await;
            }
            CoreMessage::Peer(peer::CoreEvent::PeerConnState { peer_id, state }) => {
                if let Some(p) = self.state.peers.get_mut(&peer_id) {
                    p.conn_state = state;
                }
            }
            CoreMessage::IncomingRequestVote { args, respond_to } => {
                let reply = self.handle_request_vote(args).await;
                let _ = respond_to.send(reply);
            }
            CoreMessage::IncomingAppendEntries { args, respond_to } => {
                let reply = self.handle_append_entries(args).await;
                let _ = respond_to.send(reply);
            }
            CoreMessage::CommitRequest { entry, respond_to } => {
                self.handle_commit_request(entry, respond_to).await;
            }
            CoreMessage::Shutdown => {
                self.shutting_down = true;
            }
        }
        self.publish_snapshot();
    }

    // ---- Election Scheduler (spec §4.2) ----

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state.role {
            Role::Follower => {
                if now.duration_since(self.state.last_ping_recv_time) >= self.config.election_timeout {
                    let ready = self.state.cluster_size == 1
                        || self.state.idle_peer_count() >= RaftConfig::idle_quorum(self.state.cluster_size);
                    if ready {
                        self.pending_election_readiness = None;
                        self.become_candidate().await;
                    } else {
                        let started_at = self
                            .pending_election_readiness
                            .get_or_insert_with(|| PendingElectionReadiness { started_at: now })
                            .started_at;
                        if now.duration_since(started_at) >= self.config.wait_peers_ready_timeout {
                            // spec §4.2: "wait on PeersReady (bounded by
                            // WaitPeersReadyMs)". Give up this attempt rather
                            // than re-checking every tick forever (mirrors
                            // handle_commit_request's PendingReadyCommit
                            // bound) and wait out a fresh election_timeout
                            // before trying again.
                            log::warn!(
                                "election readiness wait exceeded wait_peers_ready_timeout; deferring to next election timeout"
                            );
                            self.pending_election_readiness = None;
                            self.state.last_ping_recv_time = now;
                        }
                    }
                } else {
                    self.pending_election_readiness = None;
                }
            }
            Role::Candidate => {
                if let Some(retry_at) = self.next_candidate_retry_at {
                    if now >= retry_at {
                        self.next_candidate_retry_at = None;
                        self.become_candidate().await;
                    }
                } else if let Some(pending) = &self.pending_election {
                    if now >= pending.deadline {
                        self.pending_election = None;
                        self.next_candidate_retry_at = Some(now + split_vote_wait(self.config.reelection_rand));
                    }
                }
            }
            Role::Leader { .. } => {
                self.send_heartbeats().await;
            }
        }

        if let Some(pc) = &self.pending_commit {
            if now >= pc.deadline {
                let pc = self.pending_commit.take().unwrap();
                let _ = pc.respond_to.send(Err(RaftError::InsufficientQuorum));
            }
        }

        if self.pending_ready_commit.is_some() {
            let ready = self.state.idle_peer_count() >= RaftConfig::idle_quorum(self.state.cluster_size);
            let expired = self
                .pending_ready_commit
                .as_ref()
                .map(|p| now >= p.deadline)
                .unwrap_or(false);
            if ready {
                let pending = self.pending_ready_commit.take().unwrap();
                self.begin_replication(pending.entry, pending.respond_to).await;
            } else if expired {
                let pending = self.pending_ready_commit.take().unwrap();
                let _ = pending.respond_to.send(Err(RaftError::InsufficientQuorum));
            }
        }

        self.publish_snapshot();
    }

    async fn become_candidate(&mut self) {
        self.state.role = Role::Candidate;
        self.state.current_term += 1;
        self.state.voted_for = Some(self.config.hostname.clone());
        self.state.voted_for_term = self.state.current_term;
        self.persist_term_and_vote().await;

        self.state.vote_consensus_term = self.state.current_term;
        self.state.vote_consensus_count = 1; // votes for itself
        self.state.vote_denied_count = 0;
        self.state.last_ping_recv_time = Instant::now();

        if self.state.vote_consensus_count >= RaftConfig::quorum(self.state.cluster_size) {
            self.become_leader().await;
            return;
        }

        self.pending_election = Some(PendingElection {
            deadline: Instant::now() + self.config.wait_consensus_timeout,
        });
        self.broadcast_request_vote().await;
    }

    async fn broadcast_request_vote(&mut self) {
        for (peer_id, handle) in &self.peer_handles {
            if self.state.peers.get(peer_id).map(|p| p.is_deleted).unwrap_or(true) {
                continue;
            }
            let _ = handle.to_peer.try_send(PeerCommand::RequestVote {
                term: self.state.current_term,
                last_log_index: self.state.last_log_index,
                last_log_term: self.state.last_log_term,
            });
        }
    }

    async fn become_leader(&mut self) {
        self.pending_election = None;
        self.next_candidate_retry_at = None;
        self.state.role = Role::Leader {
            transitioning: self.state.cluster_size > 1,
        };
        self.state.leader_hint = Some(self.config.hostname.clone());
        for p in self.state.peers.values_mut() {
            p.match_index = 0;
            p.log_replicated_this_round = false;
        }
        self.publish_snapshot();
    }

    async fn send_heartbeats(&mut self) {
        let target_index = self.state.last_log_index;
        let leader_commit = self.state.commit_index;
        let term = self.state.current_term;
        for (peer_id, handle) in &self.peer_handles {
            let idle = self
                .state
                .peers
                .get(peer_id)
                .map(|p| p.is_idle() && !p.is_deleted)
                .unwrap_or(false);
            if idle {
                let _ = handle.to_peer.try_send(PeerCommand::Replicate {
                    term,
                    leader_commit,
                    target_index,
                });
            }
        }
    }

    // ---- RequestVote receiver (spec §4.4 receiver) ----

    async fn handle_request_vote(&mut self, args: RequestVoteArgs) -> RequestVoteReply {
        if !self.state.initialized {
            // Transient: this node hasn't finished loading its own persisted
            // term/vote yet, so it cannot safely judge a candidate's log
            // (spec §4.4 "refuses to vote while initialized == false").
            return RequestVoteReply {
                current_term: self.state.current_term,
                vote_status: VoteDecision::Denied.to_wire(),
            };
        }
        if args.term < self.state.current_term {
            return RequestVoteReply {
                current_term: self.state.current_term,
                vote_status: VoteDecision::Denied.to_wire(),
            };
        }
        if args.term > self.state.current_term {
            self.step_down(args.term).await;
        }

        let candidate_log_ok = args.last_log_term > self.state.last_log_term
            || (args.last_log_term == self.state.last_log_term
                && args.last_log_index >= self.state.last_log_index);
        if !candidate_log_ok {
            return RequestVoteReply {
                current_term: self.state.current_term,
                vote_status: VoteDecision::DeniedShorterLog.to_wire(),
            };
        }

        let already_voted_for_other = self.state.voted_for_term == args.term
            && self
                .state
                .voted_for
                .as_deref()
                .map(|v| v != args.candidate_id)
                .unwrap_or(false);
        if already_voted_for_other {
            return RequestVoteReply {
                current_term: self.state.current_term,
                vote_status: VoteDecision::Denied.to_wire(),
            };
        }

        self.state.voted_for = Some(args.candidate_id.clone());
        self.state.voted_for_term = args.term;
        self.persist_term_and_vote().await;
        self.state.last_ping_recv_time = Instant::now();

        RequestVoteReply {
            current_term: self.state.current_term,
            vote_status: VoteDecision::Granted.to_wire(),
        }
    }

    async fn handle_vote_result(&mut self, _peer_id: String, result: Result<RequestVoteReply, RaftError>) {
        if !matches!(self.state.role, Role::Candidate) {
            return;
        }
        let reply = match result {
            Ok(r) => r,
            Err(_) => return, // peer driver owns reconnect/backoff for transport errors
        };
        if reply.current_term > self.state.current_term {
            self.step_down(reply.current_term).await;
            return;
        }
        if reply.current_term != self.state.vote_consensus_term {
            return; // stale reply from a round we already moved past
        }
        match reply.vote_status {
            0 => {
                self.state.vote_consensus_count += 1;
                if self.state.vote_consensus_count >= RaftConfig::quorum(self.state.cluster_size) {
                    self.become_leader().await;
                }
            }
            2 => {
                // Denied because our log is shorter than the voter's (spec
                // §4.4 sender): step down immediately rather than waste the
                // rest of this term waiting on other replies (scenario S5).
                self.state.vote_denied_count += 1;
                self.step_down(reply.current_term).await;
            }
            _ => {
                self.state.vote_denied_count += 1;
            }
        }
    }

    // ---- AppendEntries receiver (spec §4.5 receiver) ----

    async fn handle_append_entries(&mut self, args: AppendEntriesArgs) -> AppendEntriesReply {
        if args.term < self.state.current_term {
            return AppendEntriesReply {
                current_term: self.state.current_term,
                status: 1,
            };
        }
        if args.term > self.state.current_term || !matches!(self.state.role, Role::Follower) {
            self.step_down(args.term).await;
        }
        self.state.leader_hint = Some(args.leader_id.clone());
        self.state.last_ping_recv_time = Instant::now();

        // spec §4.5 receiver: "if prevLogIndex == 0 or local log matches
        // (prevLogIndex, prevLogTerm), delete all local entries at indices
        // >= prevLogIndex+1" — unconditionally, even for an empty-payload
        // ping, so a stale divergent tail left behind by a prior leader gets
        // cleaned up the moment a current leader's heartbeat reaches this
        // index (spec §8 scenario S4).
        if args.prev_log_index > 0 {
            match self.log.get(args.prev_log_index).await {
                Ok(Some(e)) if e.term == args.prev_log_term => {}
                Ok(_) => {
                    return AppendEntriesReply {
                        current_term: self.state.current_term,
                        status: 1,
                    };
                }
                Err(e) => {
                    log::error!("log read failed during AppendEntries: {e}");
                    return AppendEntriesReply {
                        current_term: self.state.current_term,
                        status: 1,
                    };
                }
            }
        }
        if let Err(e) = self.log.truncate_from(args.prev_log_index + 1).await {
            log::error!(
                "failed to truncate divergent tail at {}: {e}",
                args.prev_log_index + 1
            );
        }

        for entry in &args.entries {
            if let Err(e) = self.log.append(entry.clone()).await {
                log::error!("failed to append entry {}: {e}", entry.index);
            }
        }

        if let Ok((last_index, last_term)) = self.log.last().await {
            self.state.last_log_index = last_index;
            self.state.last_log_term = last_term;
        }

        if args.leader_commit > self.state.commit_index {
            let new_commit = args.leader_commit.min(self.state.last_log_index);
            self.advance_commit_and_apply(new_commit).await;
        }

        AppendEntriesReply {
            current_term: self.state.current_term,
            status: 0,
        }
    }

    async fn handle_append_result(
        &mut self,
        peer_id: String,
        target_index: u64,
        result: Result<ReplicateOutcome, RaftError>,
    ) {
        if !self.state.role.is_leader() {
            return;
        }
        let outcome = match result {
            Ok(o) => o,
            Err(_) => return,
        };
        if outcome.peer_current_term > self.state.current_term {
            self.step_down(outcome.peer_current_term).await;
            return;
        }
        if let Some(p) = self.state.peers.get_mut(&peer_id) {
            if outcome.matched_index > p.match_index {
                p.match_index = outcome.matched_index;
            }
            if outcome.matched_index >= target_index {
                p.log_replicated_this_round = true;
            }
        }
        self.recompute_commit_index().await;
        self.check_pending_commit_quorum();
        self.check_transitioning_progress();
    }

    /// Standard Raft commit-index advancement: the highest index replicated
    /// to a quorum whose entry belongs to the current term (spec §4.6 "only
    /// entries from the leader's own term are counted directly").
    async fn recompute_commit_index(&mut self) {
        if !self.state.role.is_leader() {
            return;
        }
        let quorum = RaftConfig::quorum(self.state.cluster_size);
        let mut candidate = self.state.commit_index;
        let mut n = self.state.commit_index + 1;
        while n <= self.state.last_log_index {
            let replicated_count = 1
                + self
                    .state
                    .peers
                    .values()
                    .filter(|p| !p.is_deleted && p.match_index >= n)
                    .count();
            if replicated_count >= quorum {
                match self.log.get(n).await {
                    Ok(Some(e)) if e.term == self.state.current_term => candidate = n,
                    _ => {}
                }
            }
            n += 1;
        }
        if candidate > self.state.commit_index {
            self.advance_commit_and_apply(candidate).await;
        }
    }

    fn check_pending_commit_quorum(&mut self) {
        if let Some(pc) = &self.pending_commit {
            if self.state.commit_index >= pc.entry.index {
                let pc = self.pending_commit.take().unwrap();
                let _ = pc.respond_to.send(Ok(()));
            }
        }
    }

    fn check_transitioning_progress(&mut self) {
        if let Role::Leader { transitioning: true } = self.state.role {
            if self.state.commit_index >= self.state.last_log_index {
                self.state.role = Role::Leader { transitioning: false };
            }
        }
    }

    // ---- Commit Hook (spec §4.6) ----

    async fn handle_commit_request(
        &mut self,
        entry: LogEntry,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    ) {
        if entry.is_none() {
            let _ = respond_to.send(Ok(()));
            return;
        }
        if !self.state.role.is_leader() || self.state.role.disallows_updates() {
            let _ = respond_to.send(Err(RaftError::UnwillingToPerform));
            return;
        }

        if self.state.cluster_size < 2 {
            if let Err(e) = self.log.append(entry.clone()).await {
                let _ = respond_to.send(Err(e));
                return;
            }
            self.state.last_log_index = entry.index;
            self.state.last_log_term = entry.term;
            self.advance_commit_and_apply(entry.index).await;
            let _ = respond_to.send(Ok(()));
            return;
        }

        if self.state.idle_peer_count() < RaftConfig::idle_quorum(self.state.cluster_size) {
            // spec §4.6: "Wait on PeersReady until quorum-1 peers are Idle
            // (bounded retries with WaitPeersReadyMs)." Queue the request and
            // re-check readiness every tick rather than failing outright —
            // peers reconnecting right after an election shouldn't spuriously
            // fail a write that would have gone through moments later.
            self.pending_ready_commit = Some(PendingReadyCommit {
                entry,
                respond_to,
                deadline: Instant::now() + self.config.wait_peers_ready_timeout,
            });
            return;
        }

        self.begin_replication(entry, respond_to).await;
    }

    /// Appends `entry` to the log and broadcasts it to every peer driver,
    /// arming the [`PendingCommit`] that [`RaftCore::handle_append_result`]
    /// resolves once quorum replication is observed (spec §4.6, continued
    /// from [`RaftCore::handle_commit_request`] once a quorum of peers is
    /// known to be Idle).
    async fn begin_replication(
        &mut self,
        entry: LogEntry,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    ) {
        if let Err(e) = self.log.append(entry.clone()).await {
            let _ = respond_to.send(Err(e));
            return;
        }
        self.state.last_log_index = entry.index;
        self.state.last_log_term = entry.term;
        for p in self.state.peers.values_mut() {
            p.log_replicated_this_round = false;
        }

        self.pending_commit = Some(PendingCommit {
            entry: entry.clone(),
            respond_to,
            deadline: Instant::now() + self.config.wait_consensus_timeout,
        });

        let target_index = entry.index;
        let leader_commit = self.state.commit_index;
        let term = self.state.current_term;
        for (peer_id, handle) in &self.peer_handles {
            if self.state.peers.get(peer_id).map(|p| p.is_deleted).unwrap_or(true) {
                continue;
            }
            let _ = handle.to_peer.try_send(PeerCommand::Replicate {
                term,
                leader_commit,
                target_index,
            });
        }
    }

    /// Applies every committed-but-unapplied entry (spec §4.7), reacting to
    /// membership changes along the way (spec §4.8).
    async fn advance_commit_and_apply(&mut self, new_commit: u64) {
        self.state.commit_index = new_commit;
        if let Ok(Some(e)) = self.log.get(new_commit).await {
            self.state.commit_index_term = e.term;
        }

        while self.state.last_applied < self.state.commit_index {
            let next = self.state.last_applied + 1;
            let entry = match self.log.get(next).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    log::error!("commit index advanced past missing log entry {next}");
                    break;
                }
                Err(e) => {
                    log::error!("log read failed while applying index {next}: {e}");
                    break;
                }
            };
            match self.applier.apply(&entry).await {
                Ok(Some(MembershipChange::Add { peer_id, address })) => {
                    self.state.last_applied = next;
                    self.spawn_peer(peer_id, address);
                }
                Ok(Some(MembershipChange::Remove { peer_id })) => {
                    self.state.last_applied = next;
                    self.remove_peer(&peer_id).await;
                }
                Ok(None) => {
                    self.state.last_applied = next;
                }
                Err(e) => {
                    log::error!("apply failed at index {next}: {e}");
                    break;
                }
            }
        }

        self.check_transitioning_progress();
        self.publish_snapshot();
    }

    fn spawn_peer(&mut self, peer_id: String, address: String) {
        if self.state.peers.contains_key(&peer_id) || peer_id == self.config.hostname {
            return;
        }
        self.state.peers.insert(peer_id.clone(), PeerRecord::new());
        self.state.cluster_size = membership::cluster_size(self.state.active_peer_count());
        self.start_peer_driver(peer_id, address);
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        if membership::reject_self_removal(&self.config.hostname, peer_id).is_err() {
            log::warn!("ignoring committed entry that would remove this node's own membership");
            return;
        }
        if let Some(handle) = self.peer_handles.remove(peer_id) {
            let _ = handle.to_peer.send(PeerCommand::Shutdown).await;
        }
        if let Some(p) = self.state.peers.get_mut(peer_id) {
            p.is_deleted = true;
        }
        self.state.cluster_size = membership::cluster_size(self.state.active_peer_count());
    }

    // ---- shared plumbing ----

    async fn step_down(&mut self, new_term: u32) {
        if new_term > self.state.current_term {
            self.state.current_term = new_term;
            self.state.voted_for = None;
            self.state.voted_for_term = 0;
            self.persist_term_and_vote().await;
        }
        let was_leader = self.state.role.is_leader();
        self.state.role = Role::Follower;
        self.pending_election = None;
        self.pending_election_readiness = None;
        self.next_candidate_retry_at = None;
        if was_leader {
            if let Some(pc) = self.pending_commit.take() {
                let _ = pc.respond_to.send(Err(RaftError::UnwillingToPerform));
            }
            if let Some(pc) = self.pending_ready_commit.take() {
                let _ = pc.respond_to.send(Err(RaftError::UnwillingToPerform));
            }
        }
        self.publish_snapshot();
    }

    async fn persist_term_and_vote(&mut self) {
        match self.pss.load().await {
            Ok(mut persisted) => {
                persisted.current_term = self.state.current_term;
                persisted.voted_for = self.state.voted_for.clone();
                persisted.voted_for_term = self.state.voted_for_term;
                if let Err(e) = self.pss.store(persisted).await {
                    log::error!("failed to persist term/vote: {e}");
                }
            }
            Err(e) => log::error!("failed to load PSS before persisting term/vote: {e}"),
        }
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot_tx.send(RaftSnapshot::from(&self.state));
    }
}

/// Spec §4.2: the split-vote retry delay is drawn uniformly from
/// `[150, 150 + reelection_rand]` milliseconds. Spec §9 Open Question (a)
/// flags that the original's equivalent wait-time computation can go
/// negative under clock skew; this crate sidesteps that entirely by deriving
/// the delay from a fresh random draw each retry rather than subtracting two
/// clock readings, but still clamps the configured bound defensively.
fn split_vote_wait(reelection_rand: Duration) -> Duration {
    let bound_ms = reelection_rand.as_millis().max(1) as u64;
    let jitter_ms = rand::thread_rng().gen_range(0..=bound_ms);
    Duration::from_millis(150 + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{DirectoryWrite, MemoryBackend};
    use crate::log::{MemoryLog, RequestCode};
    use crate::pss::MemoryPss;

    fn no_peers_factory() -> Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync> {
        Arc::new(|_addr: &str| -> Arc<dyn PeerTransport> { unreachable!("no peers configured") })
    }

    async fn solo_core() -> RaftCore {
        let config = RaftConfig::from_millis("solo", vec![], 20, 80, 200, 200, 50).unwrap();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let pss: Arc<dyn PersistentStateStore> = Arc::new(MemoryPss::new());
        let backend = Arc::new(MemoryBackend::new());
        let applier = Applier::new(backend, pss.clone(), "solo");
        let (_, core) = RaftCore::new(config, vec![], log, pss, applier, no_peers_factory()).await;
        core
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself_leader_on_timeout() {
        let mut core = solo_core().await;
        core.state.last_ping_recv_time =
            Instant::now() - core.config.election_timeout - Duration::from_millis(5);
        core.on_tick().await;
        assert!(core.state.role.is_leader());
        assert_eq!(core.state.current_term, 1);
    }

    /// spec §4.2: "wait on PeersReady (bounded by WaitPeersReadyMs)". A
    /// follower past its election timeout with no peers Idle must not spin
    /// forever re-checking every tick; once `wait_peers_ready_timeout`
    /// elapses it gives up the attempt and waits out a fresh election
    /// timeout, the same bounded-retry shape `handle_commit_request` already
    /// applies to the commit path.
    #[tokio::test]
    async fn follower_gives_up_election_attempt_after_wait_peers_ready_timeout() {
        let config = RaftConfig::from_millis("solo", vec![], 20, 80, 200, 30, 50).unwrap();
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let pss: Arc<dyn PersistentStateStore> = Arc::new(MemoryPss::new());
        let backend = Arc::new(MemoryBackend::new());
        let applier = Applier::new(backend, pss.clone(), "solo");
        let (_, mut core) =
            RaftCore::new(config, vec![], log, pss, applier, no_peers_factory()).await;

        // One peer, never Idle (stays PendingAdd): idle_quorum(2) == 1, so
        // readiness can never be reached.
        core.state.peers.insert("peer-b".into(), PeerRecord::new());
        core.state.cluster_size = 2;

        core.state.last_ping_recv_time =
            Instant::now() - core.config.election_timeout - Duration::from_millis(5);
        core.on_tick().await;
        assert!(matches!(core.state.role, Role::Follower));
        assert!(core.pending_election_readiness.is_some());

        tokio::time::sleep(core.config.wait_peers_ready_timeout + Duration::from_millis(10)).await;
        core.on_tick().await;
        assert!(matches!(core.state.role, Role::Follower));
        assert!(core.pending_election_readiness.is_none());
        assert!(
            Instant::now().duration_since(core.state.last_ping_recv_time)
                < core.config.election_timeout
        );
    }

    #[tokio::test]
    async fn standalone_commit_applies_immediately() {
        let mut core = solo_core().await;
        core.state.role = Role::Leader { transitioning: false };
        core.state.leader_hint = Some("solo".into());

        let write = DirectoryWrite {
            dn: "cn=alice,dc=example".into(),
            peer_account: None,
        };
        let entry = LogEntry {
            index: 1,
            term: 0,
            entry_id: 1,
            request_code: RequestCode::Add,
            payload: bincode::serialize(&write).unwrap(),
        };
        let (tx, rx) = oneshot::channel();
        core.handle_commit_request(entry, tx).await;
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(core.state.commit_index, 1);
        assert_eq!(core.state.last_applied, 1);
    }

    /// spec §4.6: a commit arriving before quorum-1 peers are Idle queues
    /// instead of failing outright, and proceeds once readiness catches up
    /// within `WaitPeersReadyMs` (here exercised by flipping the peer Idle
    /// between the request and the next tick).
    #[tokio::test]
    async fn commit_request_queues_until_peers_become_idle() {
        let mut core = solo_core().await;
        core.state.role = Role::Leader { transitioning: false };
        core.state.cluster_size = 2;
        core.state.peers.insert("peer-b".into(), PeerRecord::new());
        // PeerRecord::new() starts PendingAdd, not Idle: idle_quorum(2) == 1
        // other peer must be Idle, so this commit cannot proceed yet.

        let entry = LogEntry {
            index: 1,
            term: 0,
            entry_id: 1,
            request_code: RequestCode::Add,
            payload: Vec::new(),
        };
        let (tx, rx) = oneshot::channel();
        core.handle_commit_request(entry, tx).await;
        assert!(core.pending_ready_commit.is_some());
        assert!(core.pending_commit.is_none());

        core.state.peers.get_mut("peer-b").unwrap().conn_state = crate::state::PeerConnState::Idle;
        core.on_tick().await;

        assert!(core.pending_ready_commit.is_none());
        assert!(core.pending_commit.is_some());
        assert_eq!(core.state.last_log_index, 1);
        drop(rx); // entry is still replicating; this test only covers the readiness gate
    }

    #[tokio::test]
    async fn non_leader_rejects_commit_request() {
        let mut core = solo_core().await;
        let entry = LogEntry {
            index: 1,
            term: 0,
            entry_id: 1,
            request_code: RequestCode::Delete,
            payload: Vec::new(),
        };
        let (tx, rx) = oneshot::channel();
        core.handle_commit_request(entry, tx).await;
        assert!(matches!(rx.await.unwrap(), Err(RaftError::UnwillingToPerform)));
    }

    #[tokio::test]
    async fn request_vote_denies_candidate_with_shorter_log() {
        let mut core = solo_core().await;
        core.state.last_log_index = 5;
        core.state.last_log_term = 3;

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: "x".into(),
            last_log_index: 2,
            last_log_term: 2,
        };
        let reply = core.handle_request_vote(args).await;
        assert_eq!(reply.vote_status, 2);
        assert_eq!(core.state.current_term, 1); // term still advances
    }

    /// S5 — candidate with shorter log is denied: the sender side must step
    /// down to Follower on a `vote_status == 2` reply rather than waiting out
    /// the rest of the vote round (spec §4.4 sender).
    #[tokio::test]
    async fn vote_reply_with_shorter_log_denial_steps_candidate_down() {
        let mut core = solo_core().await;
        core.state.role = Role::Candidate;
        core.state.current_term = 2;
        core.state.vote_consensus_term = 2;
        core.state.vote_consensus_count = 1;

        core.handle_vote_result(
            "e".into(),
            Ok(RequestVoteReply {
                current_term: 2,
                vote_status: 2,
            }),
        )
        .await;

        assert!(matches!(core.state.role, Role::Follower));
        assert_eq!(core.state.vote_denied_count, 1);
    }

    #[tokio::test]
    async fn request_vote_grants_when_log_is_current() {
        let mut core = solo_core().await;
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: "x".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let reply = core.handle_request_vote(args).await;
        assert_eq!(reply.vote_status, 0);
        assert_eq!(core.state.voted_for.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn restart_restores_term_vote_and_last_applied_from_pss() {
        let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
        let pss: Arc<dyn PersistentStateStore> = Arc::new(MemoryPss::new());
        pss.store(crate::pss::PersistentState {
            current_term: 7,
            voted_for: Some("node-b".into()),
            voted_for_term: 7,
            last_applied: 3,
        })
        .await
        .unwrap();
        log.append(LogEntry {
            index: 1,
            term: 5,
            entry_id: 1,
            request_code: RequestCode::Add,
            payload: vec![],
        })
        .await
        .unwrap();

        let config = RaftConfig::from_millis("solo", vec![], 20, 80, 200, 200, 50).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let applier = Applier::new(backend, pss.clone(), "solo");
        let (_, core) =
            RaftCore::new(config, vec![], log, pss, applier, no_peers_factory()).await;

        assert_eq!(core.state.current_term, 7);
        assert_eq!(core.state.voted_for.as_deref(), Some("node-b"));
        assert_eq!(core.state.last_applied, 3);
        assert_eq!(core.state.commit_index, 3);
        assert_eq!(core.state.last_log_index, 1);
        assert_eq!(core.state.last_log_term, 5);
        assert!(core.state.initialized);
    }

    #[tokio::test]
    async fn append_entries_with_stale_term_is_rejected() {
        let mut core = solo_core().await;
        core.state.current_term = 5;
        let args = AppendEntriesArgs {
            term: 3,
            leader_id: "someone".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![],
        };
        let reply = core.handle_append_entries(args).await;
        assert_eq!(reply.status, 1);
        assert_eq!(reply.current_term, 5);
    }

    /// S4 — divergent follower tail: a follower with a stale-leader tail at
    /// indices 11,12 accepts a new leader's `AppendEntries(prevLogIndex=10,
    /// prevLogTerm=5)` and discards the divergent tail before replying
    /// `status=0` (spec §4.5 receiver, §8 scenario S4).
    #[tokio::test]
    async fn append_entries_truncates_divergent_follower_tail() {
        let mut core = solo_core().await;
        for index in 1..=10u64 {
            core.log
                .append(LogEntry {
                    index,
                    term: 5,
                    entry_id: index,
                    request_code: RequestCode::Add,
                    payload: vec![],
                })
                .await
                .unwrap();
        }
        for (index, term) in [(11u64, 4u32), (12, 4)] {
            core.log
                .append(LogEntry {
                    index,
                    term,
                    entry_id: index,
                    request_code: RequestCode::Add,
                    payload: vec![],
                })
                .await
                .unwrap();
        }
        core.state.current_term = 4;
        core.state.last_log_index = 12;
        core.state.last_log_term = 4;

        let args = AppendEntriesArgs {
            term: 5,
            leader_id: "a".into(),
            prev_log_index: 10,
            prev_log_term: 5,
            leader_commit: 0,
            entries: vec![],
        };
        let reply = core.handle_append_entries(args).await;
        assert_eq!(reply.status, 0);
        assert!(core.log.get(11).await.unwrap().is_none());
        assert!(core.log.get(12).await.unwrap().is_none());
        assert_eq!(core.state.last_log_index, 10);
        assert_eq!(core.state.last_log_term, 5);
    }
}
