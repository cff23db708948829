//! Replicated state machine.
//!
//! Every committed log entry is a serialized [`Command`]. [`GraphFsm`] decodes it and
//! applies it to the local graph in log order; apply never invents identifiers, so
//! replicas fed the same log converge on the same graph.

pub mod command;
mod machine;
pub mod snapshot;

pub use command::{Command, CommandError, Method, NodePayload, Operation};
pub use machine::{Applied, ApplyError, ApplyFailure, FailureKind, GraphFsm};
pub use snapshot::GraphSnapshot;
