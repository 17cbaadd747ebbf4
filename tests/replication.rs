//! End-to-end scenarios from spec.md §8, grounded in the teacher's
//! `tests/replication.rs` shape (spin up N nodes, wire them together, assert
//! on replicated state) but swapping the teacher's fixed-port TCP listeners
//! for an in-process transport: each "address" is just the peer's hostname,
//! resolved through a shared registry of [`CoreHandle`]s. That keeps these
//! tests immune to port collisions while exercising the exact same
//! `RequestVote`/`AppendEntries` RPC path a real TCP transport would.

use async_trait::async_trait;
use raft_directory_engine::applier::{Applier, DirectoryWrite, MemoryBackend};
use raft_directory_engine::config::RaftConfig;
use raft_directory_engine::core::{CoreHandle, RaftCore};
use raft_directory_engine::eid::EidAllocator;
use raft_directory_engine::error::RaftError;
use raft_directory_engine::handle::RaftHandle;
use raft_directory_engine::log::{LogStore, MemoryLog};
use raft_directory_engine::pss::{MemoryPss, PersistentStateStore};
use raft_directory_engine::transport::{
    AppendEntriesArgs, AppendEntriesReply, PeerTransport, RequestVoteArgs, RequestVoteReply,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
struct Registry(Arc<RwLock<HashMap<String, CoreHandle>>>);

impl Registry {
    async fn insert(&self, id: String, handle: CoreHandle) {
        self.0.write().await.insert(id, handle);
    }

    async fn get(&self, id: &str) -> Option<CoreHandle> {
        self.0.read().await.get(id).cloned()
    }
}

/// A [`PeerTransport`] that dispatches straight into another in-process
/// node's [`CoreHandle`] instead of opening a socket. `target_id` doubles as
/// the "address": it is looked up in the shared [`Registry`] lazily, so a
/// driver started before its peer finishes constructing sees
/// `TransportUnavailable` and backs off/retries exactly as it would against
/// an unreachable host (spec §4.3).
struct InProcessTransport {
    registry: Registry,
    target_id: String,
}

impl InProcessTransport {
    async fn target(&self) -> Result<CoreHandle, RaftError> {
        self.registry.get(&self.target_id).await.ok_or_else(|| {
            RaftError::TransportUnavailable(format!("{} not registered yet", self.target_id))
        })
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn connect(&self) -> Result<(), RaftError> {
        self.target().await.map(|_| ())
    }

    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        self.target().await?.request_vote(args).await
    }

    async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply, RaftError> {
        self.target().await?.append_entries(args).await
    }
}

struct Node {
    id: String,
    handle: RaftHandle,
    core: CoreHandle,
    backend: Arc<MemoryBackend>,
    pss: Arc<dyn PersistentStateStore>,
    log: Arc<dyn LogStore>,
}

fn fast_config(id: &str, peers: Vec<String>) -> RaftConfig {
    // Tight but valid timeouts (election > 2*ping, per spec §5) so these
    // tests settle in well under a second.
    RaftConfig::from_millis(id, peers, 20, 80, 300, 300, 40).unwrap()
}

async fn spawn_node(id: &str, peer_ids: Vec<String>, registry: &Registry) -> Node {
    let config = fast_config(id, peer_ids.clone());
    let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
    let pss: Arc<dyn PersistentStateStore> = Arc::new(MemoryPss::new());
    let backend = Arc::new(MemoryBackend::new());
    let applier = Applier::new(backend.clone(), pss.clone(), id);

    let registry_for_factory = registry.clone();
    let transport_factory: Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync> =
        Arc::new(move |addr: &str| -> Arc<dyn PeerTransport> {
            Arc::new(InProcessTransport {
                registry: registry_for_factory.clone(),
                target_id: addr.to_string(),
            })
        });

    let initial_peers: Vec<(String, String)> =
        peer_ids.into_iter().map(|p| (p.clone(), p)).collect();

    let (core_handle, core) = RaftCore::new(
        config,
        initial_peers,
        log.clone(),
        pss.clone(),
        applier,
        transport_factory,
    )
    .await;
    registry.insert(id.to_string(), core_handle.clone()).await;
    tokio::spawn(core.run());

    let handle = RaftHandle::new(core_handle.clone(), Arc::new(EidAllocator::new()));
    Node {
        id: id.to_string(),
        handle,
        core: core_handle,
        backend,
        pss,
        log,
    }
}

async fn spawn_cluster(ids: &[&str]) -> (Vec<Node>, Registry) {
    let registry = Registry::default();
    let mut nodes = Vec::new();
    for id in ids {
        let peers: Vec<String> = ids
            .iter()
            .filter(|p| **p != *id)
            .map(|p| p.to_string())
            .collect();
        nodes.push(spawn_node(id, peers, &registry).await);
    }
    (nodes, registry)
}

/// Polls every node's snapshot until exactly one reports itself a fully
/// transitioned leader, or panics after `timeout`.
async fn wait_for_leader<'a>(nodes: &'a [Node], timeout: Duration) -> &'a Node {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for n in nodes {
            let snap = n.core.snapshot();
            if snap.role_is_leader && !snap.disallow_updates {
                return n;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_applied(backend: &MemoryBackend, dn: &str, timeout: Duration, node_id: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if backend.contains(dn).await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{node_id} never applied {dn} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn add_payload(dn: &str) -> Vec<u8> {
    bincode::serialize(&DirectoryWrite {
        dn: dn.to_string(),
        peer_account: None,
    })
    .unwrap()
}

/// S1 — single-leader steady commit, 3 nodes: elect a leader, issue one Add,
/// and expect it to land on every node's state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn steady_state_commit_replicates_to_all_nodes() {
    let (nodes, _registry) = spawn_cluster(&["n1", "n2", "n3"]).await;
    let leader = wait_for_leader(&nodes, Duration::from_secs(3)).await;

    let entry_id = leader.handle.next_new_entry_id().await;
    leader
        .handle
        .pre_commit_add(entry_id, add_payload("cn=alice,dc=example"))
        .await
        .expect("leader commit should succeed with a healthy 3-node cluster");

    for n in &nodes {
        wait_for_applied(
            &n.backend,
            "cn=alice,dc=example",
            Duration::from_secs(2),
            &n.id,
        )
        .await;
    }
}

/// S6 — cluster of 1: writes commit locally with no RPC traffic at all.
#[tokio::test]
async fn standalone_node_commits_without_peers() {
    let (nodes, _registry) = spawn_cluster(&["solo"]).await;
    let node = &nodes[0];

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !node.core.snapshot().role_is_leader {
        if tokio::time::Instant::now() >= deadline {
            panic!("solo node never self-elected");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let entry_id = node.handle.next_new_entry_id().await;
    node.handle
        .pre_commit_add(entry_id, add_payload("cn=bob,dc=example"))
        .await
        .unwrap();

    assert!(node.backend.contains("cn=bob,dc=example").await);
    assert_eq!(node.core.snapshot().commit_index, 1);
}

/// Boundary behavior (spec §8): a 2-node cluster's quorum is both nodes, so a
/// commit with both reachable must still succeed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_cluster_commits_when_both_reachable() {
    let (nodes, _registry) = spawn_cluster(&["a", "b"]).await;
    let leader = wait_for_leader(&nodes, Duration::from_secs(3)).await;

    let entry_id = leader.handle.next_new_entry_id().await;
    leader
        .handle
        .pre_commit_add(entry_id, add_payload("cn=carol,dc=example"))
        .await
        .expect("2-node cluster with both peers reachable should commit");

    for n in &nodes {
        wait_for_applied(
            &n.backend,
            "cn=carol,dc=example",
            Duration::from_secs(2),
            &n.id,
        )
        .await;
    }
}

/// Durability (spec §8 property 5): after a commit returns success, a fresh
/// `RaftCore` built on the same PSS/log restores `lastApplied` without
/// needing any peer traffic (spec §4.7, and the startup restore added in
/// `RaftCore::new`).
#[tokio::test]
async fn restart_on_same_store_restores_applied_state() {
    let (nodes, _registry) = spawn_cluster(&["solo2"]).await;
    let node = &nodes[0];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !node.core.snapshot().role_is_leader {
        if tokio::time::Instant::now() >= deadline {
            panic!("solo2 never self-elected");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entry_id = node.handle.next_new_entry_id().await;
    node.handle
        .pre_commit_add(entry_id, add_payload("cn=dora,dc=example"))
        .await
        .unwrap();
    node.core.shutdown().await;

    let config = fast_config("solo2", vec![]);
    let fresh_backend = Arc::new(MemoryBackend::new());
    let applier = Applier::new(fresh_backend, node.pss.clone(), "solo2");
    let transport_factory: Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync> =
        Arc::new(move |_addr: &str| -> Arc<dyn PeerTransport> { unreachable!("no peers") });
    let (restarted_handle, _restarted_core) = RaftCore::new(
        config,
        vec![],
        node.log.clone(),
        node.pss.clone(),
        applier,
        transport_factory,
    )
    .await;

    let snap = restarted_handle.snapshot();
    assert_eq!(snap.last_applied, 1);
    assert_eq!(snap.commit_index, 1);
}
