//! Type configuration for the replicated graph.

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use crate::fsm::{Applied, ApplyFailure};

/// Cluster member id.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Raft types for the graph state machine.
    pub TypeConfig:
        D = RaftRequest,
        R = RaftResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Log payload: one encoded [`crate::fsm::Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftRequest {
    /// Encoded command envelope.
    pub command: Vec<u8>,
}

impl RaftRequest {
    /// Wraps an encoded command.
    pub fn new(command: Vec<u8>) -> Self {
        Self { command }
    }
}

/// What the state machine returned for one log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftResponse {
    /// Log index of the entry.
    pub applied_index: u64,
    /// Apply outcome; `None` for blank and membership entries.
    pub outcome: Option<Result<Applied, ApplyFailure>>,
}

impl RaftResponse {
    /// Response for an entry that carries no command.
    pub fn empty(applied_index: u64) -> Self {
        Self {
            applied_index,
            outcome: None,
        }
    }
}
