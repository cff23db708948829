//! Raft transports.
//!
//! [`TcpNetwork`] speaks length-prefixed JSON frames over TCP: a big-endian `u32`
//! body length followed by one serialized [`RaftRpc`] or [`RaftReply`]. A connection
//! is opened on first use and dropped on any error, so the next call reconnects.
//! [`LocalRouter`] delivers the same calls in-process.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::types::{NodeId, TypeConfig};

const MAX_FRAME: u32 = 64 << 20;

/// Request sent between members.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RaftRpc {
    /// Log replication and heartbeats.
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    /// One chunk of a snapshot transfer.
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// Election request.
    Vote(VoteRequest<NodeId>),
    /// Ask the leader to admit `node_id` at `addr` as a voter.
    Join {
        /// Joining member.
        node_id: NodeId,
        /// Address it advertises.
        addr: String,
    },
    /// Ask the leader to remove `node_id`.
    Leave {
        /// Departing member.
        node_id: NodeId,
    },
}

/// Answer to a [`RaftRpc`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RaftReply {
    /// Answer to [`RaftRpc::AppendEntries`].
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    /// Answer to [`RaftRpc::InstallSnapshot`].
    InstallSnapshot(Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>),
    /// Answer to [`RaftRpc::Vote`].
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    /// Answer to a join or leave.
    Membership(MembershipReply),
}

/// Outcome of a join or leave request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipReply {
    /// True when the change was committed or already in effect.
    pub accepted: bool,
    /// Leader known to the answering node.
    pub leader_id: Option<NodeId>,
    /// Address of that leader.
    pub leader_addr: Option<String>,
    /// Failure detail when not accepted.
    pub message: Option<String>,
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds limit"))?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame; `None` on a clean end of stream.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"));
    }
    let mut body = vec![0; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn exchange(stream: &mut TcpStream, rpc: &RaftRpc) -> io::Result<RaftReply> {
    write_frame(stream, rpc).await?;
    read_frame(stream)
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"))
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

/// One-shot request on a fresh connection, used for membership calls.
pub async fn request(addr: &str, rpc: &RaftRpc, timeout: Duration) -> io::Result<RaftReply> {
    let call = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        exchange(&mut stream, rpc).await
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| timed_out("membership request"))?
}

enum CallError {
    Unreachable(io::Error),
    Network(io::Error),
}

impl CallError {
    fn into_rpc<E: std::error::Error>(self) -> RPCError<NodeId, BasicNode, E> {
        match self {
            CallError::Unreachable(err) => RPCError::Unreachable(Unreachable::new(&err)),
            CallError::Network(err) => RPCError::Network(NetworkError::new(&err)),
        }
    }
}

fn unexpected<E: std::error::Error>(reply: &RaftReply) -> RPCError<NodeId, BasicNode, E> {
    let err = io::Error::new(io::ErrorKind::InvalidData, format!("unexpected reply {reply:?}"));
    RPCError::Network(NetworkError::new(&err))
}

/// [`RaftNetworkFactory`] over TCP.
#[derive(Debug, Clone)]
pub struct TcpNetwork {
    timeout: Duration,
}

impl TcpNetwork {
    /// `timeout` bounds connect and each request/response exchange.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RaftNetworkFactory<TypeConfig> for TcpNetwork {
    type Network = TcpConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        TcpConnection {
            target,
            addr: node.addr.clone(),
            timeout: self.timeout,
            stream: None,
        }
    }
}

/// Lazily connected link to one peer.
pub struct TcpConnection {
    target: NodeId,
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpConnection {
    async fn connect(&self) -> Result<TcpStream, CallError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CallError::Unreachable(timed_out("connect")))?
            .map_err(CallError::Unreachable)?;
        stream.set_nodelay(true).map_err(CallError::Network)?;
        debug!(peer = self.target, addr = %self.addr, "raft.net.connected");
        Ok(stream)
    }

    async fn call(&mut self, rpc: RaftRpc) -> Result<RaftReply, CallError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let reply = tokio::time::timeout(self.timeout, exchange(&mut stream, &rpc))
            .await
            .map_err(|_| CallError::Network(timed_out("raft rpc")))?
            .map_err(CallError::Network)?;
        self.stream = Some(stream);
        Ok(reply)
    }
}

impl RaftNetwork<TypeConfig> for TcpConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let reply = match self.call(RaftRpc::AppendEntries(rpc)).await {
            Ok(reply) => reply,
            Err(err) => return Err(err.into_rpc()),
        };
        match reply {
            RaftReply::AppendEntries(Ok(resp)) => Ok(resp),
            RaftReply::AppendEntries(Err(err)) => Err(RPCError::RemoteError(RemoteError::new(self.target, err))),
            other => Err(unexpected(&other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let reply = match self.call(RaftRpc::InstallSnapshot(rpc)).await {
            Ok(reply) => reply,
            Err(err) => return Err(err.into_rpc()),
        };
        match reply {
            RaftReply::InstallSnapshot(Ok(resp)) => Ok(resp),
            RaftReply::InstallSnapshot(Err(err)) => Err(RPCError::RemoteError(RemoteError::new(self.target, err))),
            other => Err(unexpected(&other)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let reply = match self.call(RaftRpc::Vote(rpc)).await {
            Ok(reply) => reply,
            Err(err) => return Err(err.into_rpc()),
        };
        match reply {
            RaftReply::Vote(Ok(resp)) => Ok(resp),
            RaftReply::Vote(Err(err)) => Err(RPCError::RemoteError(RemoteError::new(self.target, err))),
            other => Err(unexpected(&other)),
        }
    }
}

/// In-process network: members registered here reach each other by direct calls.
#[derive(Clone, Default)]
pub struct LocalRouter {
    members: Arc<RwLock<BTreeMap<NodeId, Raft<TypeConfig>>>>,
}

impl LocalRouter {
    /// Creates a router with no members.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `raft` reachable as `id`.
    pub fn register(&self, id: NodeId, raft: Raft<TypeConfig>) {
        self.members.write().insert(id, raft);
    }

    /// Cuts `id` off; calls to it fail as unreachable.
    pub fn unregister(&self, id: NodeId) {
        self.members.write().remove(&id);
    }

    fn get(&self, id: NodeId) -> Option<Raft<TypeConfig>> {
        self.members.read().get(&id).cloned()
    }
}

impl RaftNetworkFactory<TypeConfig> for LocalRouter {
    type Network = LocalConnection;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        LocalConnection {
            target,
            router: self.clone(),
        }
    }
}

/// Link to one member of a [`LocalRouter`].
pub struct LocalConnection {
    target: NodeId,
    router: LocalRouter,
}

impl LocalConnection {
    fn unreachable<E: std::error::Error>(&self) -> RPCError<NodeId, BasicNode, E> {
        let err = io::Error::new(io::ErrorKind::NotConnected, format!("node {} is not registered", self.target));
        RPCError::Unreachable(Unreachable::new(&err))
    }
}

impl RaftNetwork<TypeConfig> for LocalConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let Some(raft) = self.router.get(self.target) else {
            return Err(self.unreachable());
        };
        raft.append_entries(rpc)
            .await
            .map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let Some(raft) = self.router.get(self.target) else {
            return Err(self.unreachable());
        };
        raft.install_snapshot(rpc)
            .await
            .map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let Some(raft) = self.router.get(self.target) else {
            return Err(self.unreachable());
        };
        raft.vote(rpc)
            .await
            .map_err(|err| RPCError::RemoteError(RemoteError::new(self.target, err)))
    }
}
