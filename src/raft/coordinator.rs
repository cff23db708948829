use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::metrics::WaitError;
use openraft::network::RaftNetworkFactory;
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Raft, RaftMetrics, SnapshotPolicy};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use super::membership::{plan_join, plan_leave, JoinPlan, LeavePlan};
use super::network::{self, MembershipReply, RaftReply, RaftRpc};
use super::server;
use super::store::GraphRaftStore;
use super::types::{NodeId, RaftRequest, TypeConfig};
use crate::config::RaftConfig;
use crate::fsm::{Applied, ApplyFailure, Command, GraphFsm};
use crate::graph::Graph;

const MAX_JOIN_REDIRECTS: usize = 5;

/// Failure of a cluster operation.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// This node cannot accept writes; send them to the leader instead.
    #[error("not the leader; leader is {leader_id:?} at {leader_addr:?}")]
    NotLeader {
        /// Leader this node currently follows, if known.
        leader_id: Option<NodeId>,
        /// Address of that leader, if known.
        leader_addr: Option<String>,
    },
    /// No leader was elected in time.
    #[error("no leader elected")]
    NoLeader,
    /// The deadline passed; the command may still commit later.
    #[error("no confirmation within {0:?}; outcome unknown")]
    Timeout(Duration),
    /// Committed, but the state machine rejected it.
    #[error("command rejected: {0}")]
    Apply(ApplyFailure),
    /// Openraft refused or failed the request.
    #[error("raft error: {0}")]
    Raft(String),
    /// The log store or snapshot could not be opened.
    #[error("raft storage error: {0}")]
    Storage(String),
    /// A peer could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Bad settings or arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn write_error(err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> ClusterError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => ClusterError::NotLeader {
            leader_id: forward.leader_id,
            leader_addr: forward.leader_node.map(|node| node.addr),
        },
        other => ClusterError::Raft(other.to_string()),
    }
}

/// Point-in-time view of this member.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    /// This member's id.
    pub node_id: NodeId,
    /// This member's advertised address.
    pub addr: String,
    /// `Leader`, `Follower`, `Candidate`, `Learner` or `Shutdown`.
    pub state: String,
    /// Current term.
    pub term: u64,
    /// Known leader.
    pub leader_id: Option<NodeId>,
    /// Address of the known leader.
    pub leader_addr: Option<String>,
    /// Index of the last local log entry.
    pub last_log_index: Option<u64>,
    /// Index of the last entry applied to the graph.
    pub last_applied: Option<u64>,
    /// Voting members, sorted.
    pub voters: Vec<NodeId>,
    /// Every member (voters and learners) with its address.
    pub members: BTreeMap<NodeId, String>,
    /// Command method that halted the local state machine, if any.
    pub halted: Option<String>,
}

/// One member of a replicated graph.
///
/// Wraps an openraft instance whose state machine is a [`GraphFsm`] over the local
/// graph. Writes go through [`Coordinator::propose`], which only succeeds on the
/// leader and returns once the command is committed and applied locally. Reads go
/// straight to [`Coordinator::graph`].
pub struct Coordinator {
    id: NodeId,
    addr: String,
    raft: Raft<TypeConfig>,
    store: GraphRaftStore,
    propose_timeout: Duration,
    shutdown: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl Coordinator {
    /// Opens the log and snapshot under `raft_dir`, rewinds `graph` to the last
    /// snapshot and starts the Raft core. The node stays passive until it is
    /// bootstrapped or admitted by a leader.
    pub async fn start<N>(
        id: NodeId,
        addr: impl Into<String>,
        graph: Arc<dyn Graph>,
        raft_dir: &Path,
        settings: &RaftConfig,
        network: N,
        span: Span,
    ) -> Result<Self, ClusterError>
    where
        N: RaftNetworkFactory<TypeConfig>,
    {
        let addr = addr.into();
        let config = openraft::Config {
            cluster_name: "ravel".to_string(),
            heartbeat_interval: settings.heartbeat_interval_ms,
            election_timeout_min: settings.election_timeout_min_ms,
            election_timeout_max: settings.election_timeout_max_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(settings.snapshot_logs_since_last),
            ..Default::default()
        }
        .validate()
        .map_err(|err| ClusterError::InvalidArgument(err.to_string()))?;

        let store = GraphRaftStore::open(raft_dir, graph).map_err(|err| ClusterError::Storage(err.to_string()))?;
        let (log_store, state_machine) = Adaptor::new(store.clone());
        let raft = Raft::new(id, Arc::new(config), network, log_store, state_machine)
            .instrument(span.clone())
            .await
            .map_err(|err| ClusterError::Raft(err.to_string()))?;
        span.in_scope(|| info!(node_id = id, %addr, dir = %raft_dir.display(), "raft.start"));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            id,
            addr,
            raft,
            store,
            propose_timeout: settings.propose_timeout(),
            shutdown,
            server: Mutex::new(None),
            span,
        })
    }

    /// This member's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Address peers use to reach this member.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The underlying openraft handle.
    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    /// The local state machine.
    pub fn fsm(&self) -> &GraphFsm {
        self.store.state_machine().fsm()
    }

    /// The local replica of the graph. Mutating it directly bypasses replication.
    pub fn graph(&self) -> &Arc<dyn Graph> {
        self.fsm().graph()
    }

    fn metrics(&self) -> RaftMetrics<NodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Makes this node the sole voter of a new cluster. A node that already has
    /// state treats this as a no-op.
    pub async fn bootstrap(&self) -> Result<(), ClusterError> {
        let members = BTreeMap::from([(self.id, BasicNode::new(&self.addr))]);
        match self.raft.initialize(members).instrument(self.span.clone()).await {
            Ok(()) => {
                self.span.in_scope(|| info!(node_id = self.id, "raft.bootstrap"));
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                self.span.in_scope(|| debug!(node_id = self.id, "raft.bootstrap.skipped"));
                Ok(())
            }
            Err(err) => Err(ClusterError::Raft(err.to_string())),
        }
    }

    /// Current leader id and address, when known.
    pub fn leader(&self) -> Option<(NodeId, String)> {
        let metrics = self.metrics();
        let id = metrics.current_leader?;
        let node = metrics.membership_config.membership().get_node(&id)?;
        Some((id, node.addr.clone()))
    }

    /// True while this member leads.
    pub fn is_leader(&self) -> bool {
        self.metrics().current_leader == Some(self.id)
    }

    fn ensure_leader(&self) -> Result<(), ClusterError> {
        if self.is_leader() {
            return Ok(());
        }
        let leader = self.leader();
        Err(ClusterError::NotLeader {
            leader_id: leader.as_ref().map(|(id, _)| *id),
            leader_addr: leader.map(|(_, addr)| addr),
        })
    }

    /// Point-in-time view of this member.
    pub fn stats(&self) -> ClusterStats {
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let leader_addr = metrics
            .current_leader
            .and_then(|id| membership.get_node(&id))
            .map(|node| node.addr.clone());
        ClusterStats {
            node_id: self.id,
            addr: self.addr.clone(),
            state: format!("{:?}", metrics.state),
            term: metrics.current_term,
            leader_id: metrics.current_leader,
            leader_addr,
            last_log_index: metrics.last_log_index,
            last_applied: metrics.last_applied.map(|id| id.index),
            voters: membership.voter_ids().collect(),
            members: membership
                .nodes()
                .map(|(id, node)| (*id, node.addr.clone()))
                .collect(),
            halted: self.fsm().halted(),
        }
    }

    /// Admits `node_id` at `addr` as a voter. Leader only.
    pub async fn join(&self, node_id: NodeId, addr: &str) -> Result<(), ClusterError> {
        self.ensure_leader()?;
        let membership = self.metrics().membership_config.membership().clone();
        let JoinPlan::Admit {
            remove_voters,
            remove_learners,
        } = plan_join(&membership, node_id, addr)
        else {
            self.span.in_scope(|| debug!(node_id, addr, "raft.join.noop"));
            return Ok(());
        };
        let span = self.span.clone();
        if !remove_voters.is_empty() {
            span.in_scope(|| info!(?remove_voters, "raft.join.remove_stale"));
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(remove_voters), false)
                .instrument(span.clone())
                .await
                .map_err(write_error)?;
        }
        if !remove_learners.is_empty() {
            span.in_scope(|| info!(?remove_learners, "raft.join.remove_stale"));
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(remove_learners), false)
                .instrument(span.clone())
                .await
                .map_err(write_error)?;
        }
        self.raft
            .add_learner(node_id, BasicNode::new(addr), true)
            .instrument(span.clone())
            .await
            .map_err(write_error)?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), false)
            .instrument(span.clone())
            .await
            .map_err(write_error)?;
        span.in_scope(|| info!(node_id, addr, "raft.join"));
        Ok(())
    }

    /// Removes `node_id` from the cluster. Leader only; absent members are a no-op.
    pub async fn leave(&self, node_id: NodeId) -> Result<(), ClusterError> {
        self.ensure_leader()?;
        let membership = self.metrics().membership_config.membership().clone();
        let change = match plan_leave(&membership, node_id) {
            LeavePlan::NotMember => return Ok(()),
            LeavePlan::RemoveVoter => ChangeMembers::RemoveVoters(BTreeSet::from([node_id])),
            LeavePlan::RemoveLearner => ChangeMembers::RemoveNodes(BTreeSet::from([node_id])),
        };
        self.raft
            .change_membership(change, false)
            .instrument(self.span.clone())
            .await
            .map_err(write_error)?;
        self.span.in_scope(|| info!(node_id, "raft.leave"));
        Ok(())
    }

    pub(crate) fn membership_reply(&self, outcome: Result<(), ClusterError>) -> MembershipReply {
        let leader = self.leader();
        MembershipReply {
            accepted: outcome.is_ok(),
            leader_id: leader.as_ref().map(|(id, _)| *id),
            leader_addr: leader.map(|(_, addr)| addr),
            message: outcome.err().map(|err| err.to_string()),
        }
    }

    /// Asks the cluster reachable at `seed` to admit this node, following leader
    /// redirects.
    pub async fn join_cluster(&self, seed: &str) -> Result<(), ClusterError> {
        let rpc = RaftRpc::Join {
            node_id: self.id,
            addr: self.addr.clone(),
        };
        let mut target = seed.to_string();
        for _ in 0..MAX_JOIN_REDIRECTS {
            let reply = match network::request(&target, &rpc, self.propose_timeout)
                .instrument(self.span.clone())
                .await?
            {
                RaftReply::Membership(reply) => reply,
                other => {
                    return Err(ClusterError::Transport(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected reply to join: {other:?}"),
                    )))
                }
            };
            if reply.accepted {
                self.span.in_scope(|| info!(seed = %target, "raft.join_cluster"));
                return Ok(());
            }
            match reply.leader_addr {
                Some(leader) if leader != target => {
                    self.span.in_scope(|| debug!(from = %target, to = %leader, "raft.join_cluster.redirect"));
                    target = leader;
                }
                Some(_) => {
                    return Err(ClusterError::Raft(
                        reply.message.unwrap_or_else(|| "join rejected".to_string()),
                    ))
                }
                None => return Err(ClusterError::NoLeader),
            }
        }
        Err(ClusterError::NoLeader)
    }

    /// [`Coordinator::propose_with_timeout`] with the configured deadline.
    pub async fn propose(&self, command: &Command) -> Result<Applied, ClusterError> {
        self.propose_with_timeout(command, self.propose_timeout).await
    }

    /// Replicates `command` and waits until it is committed and applied here.
    ///
    /// On [`ClusterError::Timeout`] the command may still commit; retry only
    /// idempotent commands. Apply is never retried.
    pub async fn propose_with_timeout(&self, command: &Command, timeout: Duration) -> Result<Applied, ClusterError> {
        let bytes = command
            .encode()
            .map_err(|err| ClusterError::InvalidArgument(err.to_string()))?;
        let write = self.raft.client_write(RaftRequest::new(bytes));
        let response = match tokio::time::timeout(timeout, write).instrument(self.span.clone()).await {
            Ok(result) => result.map_err(write_error)?,
            Err(_) => {
                self.span
                    .in_scope(|| warn!(method = command.method().as_str(), ?timeout, "raft.propose.timeout"));
                return Err(ClusterError::Timeout(timeout));
            }
        };
        match response.data.outcome {
            Some(Ok(applied)) => Ok(applied),
            Some(Err(failure)) => Err(ClusterError::Apply(failure)),
            None => Err(ClusterError::Raft(format!(
                "entry {} carried no command outcome",
                response.log_id.index
            ))),
        }
    }

    /// Waits until some member is leader and returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, ClusterError> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|err| wait_error(err, timeout))?;
        metrics.current_leader.ok_or(ClusterError::NoLeader)
    }

    /// Waits until the local state machine has applied `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<(), ClusterError> {
        self.raft
            .wait(Some(timeout))
            .metrics(
                move |m| m.last_applied.is_some_and(|id| id.index >= index),
                format!("applied {index}"),
            )
            .await
            .map_err(|err| wait_error(err, timeout))?;
        Ok(())
    }

    /// Answers peer RPCs on `listener` until [`Coordinator::shutdown`].
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        let task = server::run(listener, self.clone(), self.shutdown.subscribe());
        let handle = tokio::spawn(task.instrument(self.span.clone()));
        if let Some(previous) = self.server.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the server loop and the Raft core. The graph stays open.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.shutdown.send_replace(true);
        let server = self.server.lock().take();
        if let Some(handle) = server {
            if let Err(err) = handle.await {
                self.span.in_scope(|| warn!(error = %err, "raft.server.join.error"));
            }
        }
        self.raft
            .shutdown()
            .await
            .map_err(|err| ClusterError::Raft(err.to_string()))?;
        self.span.in_scope(|| info!(node_id = self.id, "raft.shutdown"));
        Ok(())
    }
}

fn wait_error(err: WaitError, timeout: Duration) -> ClusterError {
    match err {
        WaitError::Timeout(..) => ClusterError::Timeout(timeout),
        other => ClusterError::Raft(other.to_string()),
    }
}
