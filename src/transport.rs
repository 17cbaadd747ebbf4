//! The symmetric RPC surface (spec §6) and a TCP transport implementation,
//! grounded in the teacher's length-prefixed JSON-over-TCP framing
//! (`send_raft_message` / `handle_raft_message` in
//! `examples/michaelreda20-Distributed_project/src/raft.rs`).

use crate::error::RaftError;
use crate::log::LogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u32,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u32,
}

/// `vote_status` keeps the original numeric contract from spec §9 Open
/// Question (b): `0` granted, `1` denied, `2` denied because the candidate's
/// log is shorter/older. See [`crate::core::VoteDecision`] for the
/// human-readable form used internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub current_term: u32,
    pub vote_status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u32,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u32,
    pub leader_commit: u64,
    /// Empty for a ping (heartbeat / gap-closing probe).
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub current_term: u32,
    /// `0` accepted, `1` log mismatch at `prev_log_index`.
    pub status: u8,
}

/// One cluster member's RPC surface, as seen by this node's peer driver
/// (spec §6 "RPC surface"; §4.3 "Acquires credentials, opens an
/// authenticated transport").
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Opens (or re-opens) the authenticated connection to this peer.
    /// Distinguishes the error kinds spec §6 names so the peer driver can
    /// apply the right backoff (spec §4.3).
    async fn connect(&self) -> Result<(), RaftError>;

    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError>;

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}

pub async fn write_message(stream: &mut TcpStream, msg: &WireMessage) -> Result<(), RaftError> {
    let bytes = bincode::serialize(msg)
        .map_err(|e| RaftError::OperationsError(format!("rpc encode failed: {e}")))?;
    stream
        .write_u32(bytes.len() as u32)
        .await
        .map_err(|e| RaftError::TransportUnavailable(e.to_string()))?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| RaftError::TransportUnavailable(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| RaftError::TransportUnavailable(e.to_string()))?;
    Ok(())
}

pub async fn read_message(stream: &mut TcpStream) -> Result<WireMessage, RaftError> {
    let len = stream
        .read_u32()
        .await
        .map_err(|e| classify_read_error(&e))?;
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| RaftError::TransportUnavailable("connection closed".into()))?;
    bincode::deserialize(&buf)
        .map_err(|e| RaftError::OperationsError(format!("rpc decode failed: {e}")))
}

fn classify_read_error(e: &std::io::Error) -> RaftError {
    use std::io::ErrorKind::*;
    match e.kind() {
        ConnectionReset | ConnectionAborted | UnexpectedEof | BrokenPipe => {
            RaftError::TransportUnavailable("connection closed".into())
        }
        _ => RaftError::TransportUnavailable(e.to_string()),
    }
}

/// A TCP, length-prefixed, bincode-framed [`PeerTransport`]. No TLS/SASL
/// handshake is implemented — the directory's real deployment authenticates
/// at a layer this crate treats as an external collaborator (spec §1); this
/// transport's `connect` is the seam a production build would replace.
pub struct TcpPeerTransport {
    addr: String,
}

impl TcpPeerTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpPeerTransport { addr: addr.into() }
    }

    async fn open(&self) -> Result<TcpStream, RaftError> {
        TcpStream::connect(&self.addr).await.map_err(|e| {
            use std::io::ErrorKind::*;
            match e.kind() {
                ConnectionRefused => RaftError::TransportUnavailable(format!(
                    "connection rejected by {}: {e}",
                    self.addr
                )),
                TimedOut => RaftError::TransportUnavailable(format!(
                    "connect to {} timed out: {e}",
                    self.addr
                )),
                _ => RaftError::TransportUnavailable(format!("cannot connect to {}: {e}", self.addr)),
            }
        })
    }

    async fn roundtrip(&self, msg: WireMessage) -> Result<WireMessage, RaftError> {
        let mut stream = self.open().await?;
        write_message(&mut stream, &msg).await?;
        read_message(&mut stream).await
    }
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn connect(&self) -> Result<(), RaftError> {
        self.open().await.map(|_| ())
    }

    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError> {
        match self.roundtrip(WireMessage::RequestVote(args)).await? {
            WireMessage::RequestVoteReply(reply) => Ok(reply),
            _ => Err(RaftError::OperationsError(
                "unexpected reply to RequestVote".into(),
            )),
        }
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        match self.roundtrip(WireMessage::AppendEntries(args)).await? {
            WireMessage::AppendEntriesReply(reply) => Ok(reply),
            _ => Err(RaftError::OperationsError(
                "unexpected reply to AppendEntries".into(),
            )),
        }
    }
}

/// A decoded incoming RPC, handed to whatever answers on behalf of the core
/// actor (see `src/bin/demo_node.rs`, which reads a [`WireMessage`] off an
/// accepted connection, dispatches it to the [`crate::core::RaftCore`]
/// handle, and writes the matching reply variant back).
pub enum ServerRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

impl TryFrom<WireMessage> for ServerRequest {
    type Error = RaftError;

    fn try_from(msg: WireMessage) -> Result<Self, RaftError> {
        match msg {
            WireMessage::RequestVote(args) => Ok(ServerRequest::RequestVote(args)),
            WireMessage::AppendEntries(args) => Ok(ServerRequest::AppendEntries(args)),
            _ => Err(RaftError::OperationsError(
                "unexpected request variant".into(),
            )),
        }
    }
}
