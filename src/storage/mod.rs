//! Durable graph storage.
//!
//! [`KvGraph`] lays nodes, relationships and the mirrored adjacency index out over
//! an ordered key-value store ([`keys`]), with property bags passing through a
//! write-back cache ([`cache`]).

pub mod cache;
pub mod codec;
pub mod keys;
mod kv;
mod metrics;

pub use cache::{CacheWorker, FlushSink, WriteBackCache};
pub use kv::{KvGraph, KvOptions};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};
