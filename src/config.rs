//! Node configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! single-node development setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result as GraphResult;
use crate::graph::{Graph, MemoryGraph};
use crate::storage::{KvGraph, KvOptions};

/// Which [`Graph`] implementation holds the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// [`MemoryGraph`]; state is rebuilt from the Raft log on restart.
    Memory,
    /// [`KvGraph`] under [`Config::graph_dir`].
    Durable,
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached property bags.
    pub capacity: usize,
    /// Background eviction period; 0 disables the worker.
    pub gc_interval_ms: u64,
    /// Entries idle this long are flushed by the worker; 0 disables idle eviction.
    pub max_idle_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            gc_interval_ms: 1000,
            max_idle_ms: 0,
        }
    }
}

/// `[raft]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Leader heartbeat period.
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max_ms: u64,
    /// Committed entries between snapshots.
    pub snapshot_logs_since_last: u64,
    /// How long a proposal waits for commit and apply.
    pub propose_timeout_ms: u64,
    /// Deadline for a single peer RPC.
    pub rpc_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 250,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            snapshot_logs_since_last: 5000,
            propose_timeout_ms: 5000,
            rpc_timeout_ms: 1000,
        }
    }
}

impl RaftConfig {
    /// [`RaftConfig::propose_timeout_ms`] as a duration.
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// [`RaftConfig::rpc_timeout_ms`] as a duration.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Everything a `ravel-node` process needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raft id; unique and nonzero within the cluster.
    pub node_id: u64,
    /// Socket the Raft server binds.
    pub listen_addr: String,
    /// Address peers dial; defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    /// Root of the node's storage: `raft/` and `graph/` live under it.
    pub data_dir: PathBuf,
    /// Graph implementation for the local replica.
    pub backend: Backend,
    /// Write-back cache tuning for the durable backend.
    pub cache: CacheConfig,
    /// Consensus timings.
    pub raft: RaftConfig,
    /// `tracing` filter directive used when `RAVEL_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:7400".to_string(),
            advertise_addr: None,
            data_dir: PathBuf::from("ravel-data"),
            backend: Backend::Durable,
            cache: CacheConfig::default(),
            raft: RaftConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Fast elections and an in-memory graph for local experiments.
    pub fn development() -> Self {
        Self {
            backend: Backend::Memory,
            raft: RaftConfig {
                heartbeat_interval_ms: 50,
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                snapshot_logs_since_last: 500,
                propose_timeout_ms: 2000,
                rpc_timeout_ms: 500,
            },
            log_filter: "debug".to_string(),
            ..Self::default()
        }
    }

    /// Durable graph, larger cache and conservative timeouts.
    pub fn production() -> Self {
        Self {
            backend: Backend::Durable,
            cache: CacheConfig {
                capacity: 65_536,
                gc_interval_ms: 1000,
                max_idle_ms: 60_000,
            },
            raft: RaftConfig {
                heartbeat_interval_ms: 500,
                election_timeout_min_ms: 1500,
                election_timeout_max_ms: 3000,
                snapshot_logs_since_last: 20_000,
                propose_timeout_ms: 10_000,
                rpc_timeout_ms: 2000,
            },
            ..Self::default()
        }
    }

    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::Invalid("node_id must be non-zero".into()));
        }
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("listen_addr must be set".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be positive".into()));
        }
        let raft = &self.raft;
        if raft.heartbeat_interval_ms == 0 || raft.heartbeat_interval_ms >= raft.election_timeout_min_ms {
            return Err(ConfigError::Invalid(
                "raft.heartbeat_interval_ms must be positive and below election_timeout_min_ms".into(),
            ));
        }
        if raft.election_timeout_min_ms >= raft.election_timeout_max_ms {
            return Err(ConfigError::Invalid(
                "raft.election_timeout_min_ms must be below election_timeout_max_ms".into(),
            ));
        }
        if raft.propose_timeout_ms == 0 || raft.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("raft timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Address advertised to peers.
    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    /// Raft log and snapshot area.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Graph key-value area.
    pub fn graph_dir(&self) -> PathBuf {
        self.data_dir.join("graph")
    }

    /// Durable backend options derived from `[cache]`.
    pub fn kv_options(&self) -> KvOptions {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        KvOptions {
            cache_capacity: self.cache.capacity,
            gc_interval: millis(self.cache.gc_interval_ms),
            max_idle: millis(self.cache.max_idle_ms),
            ..KvOptions::default()
        }
    }

    /// Opens the configured backend.
    pub fn open_graph(&self) -> GraphResult<Arc<dyn Graph>> {
        Ok(match self.backend {
            Backend::Memory => Arc::new(MemoryGraph::new()),
            Backend::Durable => Arc::new(KvGraph::open(self.graph_dir().join("graph.redb"), self.kv_options())?),
        })
    }
}

/// Failure loading a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`Config`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed; `<inline>` for text.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },
    /// Parsed, but the values are inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.advertise_addr(), "127.0.0.1:7400");
        assert_eq!(config.raft_dir(), PathBuf::from("ravel-data/raft"));
    }

    #[test]
    fn sections_override_selected_fields() {
        let config = Config::from_toml_str(
            r#"
            node_id = 3
            listen_addr = "0.0.0.0:9000"
            advertise_addr = "10.0.0.3:9000"
            backend = "memory"

            [cache]
            capacity = 16
            gc_interval_ms = 0

            [raft]
            propose_timeout_ms = 750
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.advertise_addr(), "10.0.0.3:9000");
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.cache.capacity, 16);
        assert_eq!(config.kv_options().gc_interval, None);
        assert_eq!(config.raft.propose_timeout(), Duration::from_millis(750));
        assert_eq!(config.raft.heartbeat_interval_ms, RaftConfig::default().heartbeat_interval_ms);
    }

    #[test]
    fn presets_validate() {
        Config::development().validate().unwrap();
        Config::production().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_election_window() {
        let err = Config::from_toml_str(
            "[raft]\nelection_timeout_min_ms = 500\nelection_timeout_max_ms = 400\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "node_id = \"one\"").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path.ends_with("node.toml")));
    }
}
