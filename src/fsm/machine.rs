use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use super::command::{Command, CommandError, Method, NodePayload, Operation};
use super::snapshot::GraphSnapshot;
use crate::error::GraphError;
use crate::graph::Graph;
use crate::model::{Node, Relationship};

/// Result of a successfully applied command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Applied {
    /// A single node after the write.
    Node(Node),
    /// Nodes written by a bulk command, in command order.
    Nodes(Vec<Node>),
    /// A relationship after the write.
    Relationship(Relationship),
    /// Number of entities deleted.
    Deleted(usize),
}

/// Category of an apply failure, preserved across the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Missing node, relationship or type.
    NotFound,
    /// Arguments the graph rejected.
    InvalidArgument,
    /// Half-written mirrored adjacency.
    Consistency,
    /// Durable backend failure.
    Storage,
    /// Command method unknown to the replica.
    Unsupported,
    /// Command could not be decoded.
    Malformed,
    /// The replica stopped applying after an earlier fatal command.
    Halted,
    /// The local graph is closed.
    Closed,
}

/// Apply failure as relayed to the proposer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ApplyFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

/// Failure while applying one command.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The entry could not be decoded.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The graph rejected the operation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// An earlier unsupported command stopped this replica.
    #[error("state machine halted after unsupported command `{0}`")]
    Halted(String),
}

impl ApplyError {
    /// True when this replica must stop applying further entries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApplyError::Command(CommandError::Unsupported(_)) | ApplyError::Halted(_)
        )
    }

    /// Converts to the relayed form.
    pub fn to_failure(&self) -> ApplyFailure {
        let kind = match self {
            ApplyError::Command(CommandError::Unsupported(_)) => FailureKind::Unsupported,
            ApplyError::Command(CommandError::Malformed(_)) => FailureKind::Malformed,
            ApplyError::Halted(_) => FailureKind::Halted,
            ApplyError::Graph(GraphError::NotFound(_)) => FailureKind::NotFound,
            ApplyError::Graph(GraphError::InvalidArgument(_)) => FailureKind::InvalidArgument,
            ApplyError::Graph(GraphError::Consistency(_)) => FailureKind::Consistency,
            ApplyError::Graph(GraphError::Closed) => FailureKind::Closed,
            ApplyError::Graph(_) => FailureKind::Storage,
        };
        ApplyFailure {
            kind,
            message: self.to_string(),
        }
    }
}

/// Deterministic applier of replicated commands onto a local [`Graph`].
///
/// Entries must be fed in log order from a single task. An entry whose method this
/// version does not know halts the machine: every later apply returns
/// [`ApplyError::Halted`] until [`GraphFsm::restore`] installs a known-good state.
pub struct GraphFsm {
    graph: Arc<dyn Graph>,
    halted: Mutex<Option<String>>,
    applied: AtomicU64,
}

impl GraphFsm {
    /// Wraps a graph.
    pub fn new(graph: Arc<dyn Graph>) -> Self {
        Self {
            graph,
            halted: Mutex::new(None),
            applied: AtomicU64::new(0),
        }
    }

    /// The graph commands are applied to.
    pub fn graph(&self) -> &Arc<dyn Graph> {
        &self.graph
    }

    /// Method that halted the machine, if any.
    pub fn halted(&self) -> Option<String> {
        self.halted.lock().clone()
    }

    /// Commands applied successfully since construction.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Decodes and applies one log entry.
    pub fn apply(&self, entry: &[u8]) -> Result<Applied, ApplyError> {
        if let Some(method) = self.halted() {
            return Err(ApplyError::Halted(method));
        }
        let command = match Command::decode(entry) {
            Ok(command) => command,
            Err(CommandError::Unsupported(method)) => {
                error!(method = %method, "fsm.halted");
                *self.halted.lock() = Some(method.clone());
                return Err(CommandError::Unsupported(method).into());
            }
            Err(err) => return Err(err.into()),
        };
        self.apply_command(&command)
    }

    /// Applies an already decoded command.
    pub fn apply_command(&self, command: &Command) -> Result<Applied, ApplyError> {
        if let Some(method) = self.halted() {
            return Err(ApplyError::Halted(method));
        }
        let method = command.method();
        let outcome = self.dispatch(&command.operation);
        match &outcome {
            Ok(_) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(method = method.as_str(), "fsm.apply");
            }
            Err(err) => debug!(method = method.as_str(), error = %err, "fsm.apply.rejected"),
        }
        outcome
    }

    fn dispatch(&self, operation: &Operation) -> Result<Applied, ApplyError> {
        let graph = self.graph.as_ref();
        let applied = match operation {
            Operation::AddNode(p) => {
                Applied::Node(graph.add_node(&p.node_type, &p.id, p.properties.clone())?)
            }
            Operation::SetNodeProperties(p) => Applied::Node(graph.set_node_properties(
                &p.node_type,
                &p.id,
                p.properties.clone(),
            )?),
            Operation::DeleteNode(key) => {
                graph.del_node(&key.type_name, &key.id)?;
                Applied::Deleted(1)
            }
            Operation::BulkAdd(nodes) => Applied::Nodes(self.bulk(Method::BulkAdd, nodes)?),
            Operation::BulkSet(nodes) => Applied::Nodes(self.bulk(Method::BulkSet, nodes)?),
            Operation::BulkDelete(keys) => {
                for key in keys {
                    graph.del_node(&key.type_name, &key.id)?;
                }
                Applied::Deleted(keys.len())
            }
            Operation::AddRelationship(p) => Applied::Relationship(graph.add_relationship(
                &p.node,
                p.direction,
                &p.relation_type,
                &p.id,
                &p.other,
                p.properties.clone(),
            )?),
            Operation::DeleteRelationship(r) => {
                graph.del_relationship(&r.node, r.direction, &r.relation_type, &r.id)?;
                Applied::Deleted(1)
            }
            Operation::SetRelationshipProperties(p) => Applied::Relationship(
                graph.set_relationship_properties(&p.relation_type, &p.id, p.properties.clone())?,
            ),
        };
        Ok(applied)
    }

    // Applies in order and stops at the first failure.
    fn bulk(&self, method: Method, nodes: &[NodePayload]) -> Result<Vec<Node>, ApplyError> {
        let mut written = Vec::with_capacity(nodes.len());
        for p in nodes {
            let node = match method {
                Method::BulkSet => self
                    .graph
                    .set_node_properties(&p.node_type, &p.id, p.properties.clone())?,
                _ => self.graph.add_node(&p.node_type, &p.id, p.properties.clone())?,
            };
            written.push(node);
        }
        Ok(written)
    }

    /// Captures the full graph state.
    pub fn snapshot(&self) -> Result<GraphSnapshot, GraphError> {
        GraphSnapshot::capture(self.graph.as_ref())
    }

    /// Replaces the graph state and clears a halt.
    pub fn restore(&self, snapshot: &GraphSnapshot) -> Result<(), GraphError> {
        snapshot.restore_into(self.graph.as_ref())?;
        *self.halted.lock() = None;
        debug!(
            nodes = snapshot.nodes.len(),
            relationships = snapshot.relationships.len(),
            "fsm.restore"
        );
        Ok(())
    }
}
