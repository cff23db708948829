//! Error taxonomy shared by the graph backends.

use std::io;

use thiserror::Error;

/// Result alias used throughout the graph layer.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Failure raised by a [`crate::graph::Graph`] operation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The named node, relationship or type does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The durable backend failed while performing `op`.
    #[error("storage failure during {op}: {source}")]
    Storage {
        /// Operation that was being attempted.
        op: &'static str,
        /// Underlying backend error.
        #[source]
        source: redb::Error,
    },
    /// A mirrored adjacency pair was found half-written.
    #[error("consistency violation: {0}")]
    Consistency(String),
    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The graph has been closed and released its backend.
    #[error("graph is closed")]
    Closed,
    /// The caller supplied arguments the graph cannot honour.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Filesystem failure outside the key-value store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GraphError {
    pub(crate) fn node_not_found(node_type: &str, id: &str) -> Self {
        GraphError::NotFound(format!("node {node_type}/{id}"))
    }

    pub(crate) fn relationship_not_found(relation_type: &str, id: &str) -> Self {
        GraphError::NotFound(format!("relationship {relation_type}/{id}"))
    }

    /// Returns true for the not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

/// Attaches the attempted operation to backend errors.
pub(crate) trait StorageContext<T> {
    fn during(self, op: &'static str) -> Result<T>;
}

impl<T, E> StorageContext<T> for std::result::Result<T, E>
where
    E: Into<redb::Error>,
{
    fn during(self, op: &'static str) -> Result<T> {
        self.map_err(|err| GraphError::Storage {
            op,
            source: err.into(),
        })
    }
}
