use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer for durable graph and cache activity.
///
/// One instance is handed to the durable graph and its cache at construction, so
/// several graphs in one process can report to separate sinks.
pub trait StorageMetrics: Send + Sync {
    /// Records the creation of a node.
    fn node_created(&self);

    /// Records the deletion of a node.
    fn node_deleted(&self);

    /// Records the creation of a relationship.
    fn relationship_created(&self);

    /// Records the deletion of a relationship.
    fn relationship_deleted(&self);

    /// Records an adjacency prefix scan; `direction` is `"out"` or `"in"`.
    fn adjacency_scan(&self, direction: &'static str);

    /// Records a cache lookup and whether it hit.
    fn cache_lookup(&self, hit: bool);

    /// Records a durable write issued by the cache for a dirty entry.
    fn cache_flush(&self);

    /// Records an entry dropped from the cache.
    fn cache_eviction(&self);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn node_created(&self) {}
    fn node_deleted(&self) {}
    fn relationship_created(&self) {}
    fn relationship_deleted(&self) {}
    fn adjacency_scan(&self, _direction: &'static str) {}
    fn cache_lookup(&self, _hit: bool) {}
    fn cache_flush(&self) {}
    fn cache_eviction(&self) {}
}

/// Atomic counters, readable while the graph is in use.
#[derive(Default)]
pub struct CounterMetrics {
    /// Nodes created.
    pub nodes_created: AtomicU64,
    /// Nodes deleted.
    pub nodes_deleted: AtomicU64,
    /// Relationships created.
    pub relationships_created: AtomicU64,
    /// Relationships deleted.
    pub relationships_deleted: AtomicU64,
    /// Outgoing adjacency scans.
    pub adjacency_scans_out: AtomicU64,
    /// Incoming adjacency scans.
    pub adjacency_scans_in: AtomicU64,
    /// Cache lookups served from memory.
    pub cache_hits: AtomicU64,
    /// Cache lookups that fell through to the store.
    pub cache_misses: AtomicU64,
    /// Durable writes issued for dirty cache entries.
    pub cache_flushes: AtomicU64,
    /// Entries dropped from the cache.
    pub cache_evictions: AtomicU64,
}

impl CounterMetrics {
    /// Current flush count.
    pub fn flushes(&self) -> u64 {
        self.cache_flushes.load(Ordering::Relaxed)
    }
}

impl StorageMetrics for CounterMetrics {
    fn node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    fn node_deleted(&self) {
        self.nodes_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn relationship_created(&self) {
        self.relationships_created.fetch_add(1, Ordering::Relaxed);
    }

    fn relationship_deleted(&self) {
        self.relationships_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn adjacency_scan(&self, direction: &'static str) {
        match direction {
            "out" => {
                self.adjacency_scans_out.fetch_add(1, Ordering::Relaxed);
            }
            "in" => {
                self.adjacency_scans_in.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cache_flush(&self) {
        self.cache_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}
