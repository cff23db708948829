//! Ravel: an embeddable property graph with Raft replication.
//!
//! The [`graph::Graph`] trait is the only surface front-ends use. It has two
//! implementations, the insertion-ordered [`graph::MemoryGraph`] and the durable
//! [`storage::KvGraph`] (ordered key-value layout plus a write-back property
//! cache). Mutations are replicated as [`fsm::Command`]s through a
//! [`raft::Coordinator`], and every member applies them in log order with
//! [`fsm::GraphFsm`].

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fsm;
pub mod graph;
pub mod model;
pub mod raft;
pub mod storage;
pub mod telemetry;

pub use config::{Backend, Config, ConfigError};
pub use error::{GraphError, Result};
pub use fsm::{Applied, ApplyFailure, Command, GraphFsm};
pub use graph::{page_nodes, page_relationships, Graph, MemoryGraph};
pub use model::{props, Direction, Entity, EntityKey, Node, Properties, Relationship, Value};
pub use raft::{ClusterError, Coordinator, LocalRouter, TcpNetwork};
pub use storage::{KvGraph, KvOptions};
