//! Consensus replication of graph commands.
//!
//! Built on openraft: committed entries are [`crate::fsm::Command`]s applied by a
//! [`crate::fsm::GraphFsm`]. A member keeps two areas under its raft directory, the
//! `redb` log (`log.redb`) and the latest snapshot (`snapshot.bin`); the graph
//! itself lives wherever the caller opened it and is rebuilt from those two on
//! start.

mod coordinator;
mod log_store;
pub mod membership;
pub mod network;
mod server;
mod store;
pub mod types;

pub use coordinator::{ClusterError, ClusterStats, Coordinator};
pub use log_store::LogStore;
pub use network::{LocalRouter, MembershipReply, RaftReply, RaftRpc, TcpNetwork};
pub use store::{GraphRaftStore, StateMachine};
pub use types::{NodeId, RaftRequest, RaftResponse, TypeConfig};
