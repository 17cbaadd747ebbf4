//! Runnable wiring for manual multi-process testing, grounded in
//! `examples/michaelreda20-Distributed_project/src/bin/server.rs`'s
//! argument parsing and listener-spawning shape. Not part of the
//! specification's scope (process bootstrap/config loading are named out of
//! scope in spec.md §1) but this corpus never ships a library crate without
//! a runnable binary next to it.
//!
//! Usage: `demo_node <listen-addr> <hostname> [peer_id@addr ...]`
//!
//! Every collaborator this binary wires up (log, PSS, state-machine backend)
//! is the in-memory test double from the corresponding module; a real
//! deployment would swap those for the directory's actual storage and leave
//! everything else in this crate untouched.

use anyhow::{anyhow, bail, Result};
use log::{error, info};
use raft_directory_engine::applier::{Applier, MemoryBackend};
use raft_directory_engine::config::RaftConfig;
use raft_directory_engine::core::{CoreHandle, RaftCore};
use raft_directory_engine::eid::EidAllocator;
use raft_directory_engine::handle::RaftHandle;
use raft_directory_engine::log::{LogStore, MemoryLog};
use raft_directory_engine::pss::{MemoryPss, PersistentStateStore};
use raft_directory_engine::transport::{
    read_message, write_message, PeerTransport, ServerRequest, TcpPeerTransport, WireMessage,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("Usage: demo_node <listen-addr> <hostname> [peer_id@addr ...]");
    }
    let listen_addr = args[1].clone();
    let hostname = args[2].clone();

    let mut initial_peers = Vec::new();
    for spec in &args[3..] {
        let (id, addr) = spec
            .split_once('@')
            .ok_or_else(|| anyhow!("peer spec must be id@addr, got '{spec}'"))?;
        initial_peers.push((id.to_string(), addr.to_string()));
    }
    let peer_ids: Vec<String> = initial_peers.iter().map(|(id, _)| id.clone()).collect();

    info!("starting node {hostname} on {listen_addr}; peers: {peer_ids:?}");

    let config = RaftConfig::from_millis(hostname.clone(), peer_ids, 150, 1000, 1000, 1000, 300)?;

    let log: Arc<dyn LogStore> = Arc::new(MemoryLog::new());
    let pss: Arc<dyn PersistentStateStore> = Arc::new(MemoryPss::new());
    let backend = Arc::new(MemoryBackend::new());
    let applier = Applier::new(backend, pss.clone(), hostname.clone());

    let transport_factory: Arc<dyn Fn(&str) -> Arc<dyn PeerTransport> + Send + Sync> =
        Arc::new(|addr: &str| -> Arc<dyn PeerTransport> { Arc::new(TcpPeerTransport::new(addr)) });

    let (core_handle, core) =
        RaftCore::new(config, initial_peers, log, pss, applier, transport_factory).await;
    let engine = RaftHandle::new(core_handle.clone(), Arc::new(EidAllocator::new()));
    tokio::spawn(core.run());

    tokio::spawn(report_role_periodically(engine));

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("raft RPC listener bound on {listen_addr}");
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let core_handle = core_handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, core_handle).await {
                        error!("connection from {peer_addr} failed: {e}");
                    }
                });
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
}

/// Reads one `RequestVote`/`AppendEntries` off the connection, dispatches it
/// through the [`CoreHandle`], and writes the matching reply back.
async fn serve_connection(mut stream: TcpStream, core: CoreHandle) -> Result<()> {
    let msg = read_message(&mut stream).await?;
    let request = ServerRequest::try_from(msg)?;
    let reply = match request {
        ServerRequest::RequestVote(args) => WireMessage::RequestVoteReply(core.request_vote(args).await?),
        ServerRequest::AppendEntries(args) => {
            WireMessage::AppendEntriesReply(core.append_entries(args).await?)
        }
    };
    write_message(&mut stream, &reply).await?;
    Ok(())
}

/// A small liveness log line, purely so `demo_node` is observable when run
/// by hand across a few terminals.
async fn report_role_periodically(engine: RaftHandle) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        let leader = engine.get_leader();
        info!(
            "disallow_updates={} leader={:?}",
            engine.disallow_updates(),
            leader
        );
    }
}
