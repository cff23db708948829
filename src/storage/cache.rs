//! Write-back cache of entity property bags.
//!
//! Entries are keyed by the same bytes used in the durable keyspace. Writes stay in
//! memory until the entry is evicted (capacity, idleness, or an explicit
//! [`WriteBackCache::flush_all`]); a dirty entry is written through its
//! [`FlushSink`] before it is dropped. A failed flush leaves the entry cached and
//! returns the error.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::metrics::StorageMetrics;
use crate::error::Result;
use crate::model::Properties;

/// Destination for dirty entries.
pub trait FlushSink: Send + Sync {
    /// Persists `properties` under `key`.
    fn flush(&self, key: &[u8], properties: &Properties) -> Result<()>;
}

#[derive(Clone)]
struct CacheEntry {
    properties: Properties,
    committed: bool,
    touched_at: Instant,
    version: u64,
}

struct Candidate {
    key: Vec<u8>,
    dirty: Option<Properties>,
    version: u64,
}

/// Bounded, recency-evicted cache that defers durable writes.
pub struct WriteBackCache {
    entries: RwLock<LruCache<Vec<u8>, CacheEntry>>,
    // held for the whole of an eviction or flush pass
    evicting: Mutex<()>,
    capacity: usize,
    next_version: AtomicU64,
    sink: Arc<dyn FlushSink>,
    metrics: Arc<dyn StorageMetrics>,
}

impl WriteBackCache {
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize, sink: Arc<dyn FlushSink>, metrics: Arc<dyn StorageMetrics>) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            evicting: Mutex::new(()),
            capacity: capacity.max(1),
            next_version: AtomicU64::new(1),
            sink,
            metrics,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries not yet written to durable storage.
    pub fn dirty_len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.committed)
            .count()
    }

    /// Looks up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &[u8]) -> Option<Properties> {
        let mut entries = self.entries.write();
        let hit = entries.get_mut(key).map(|entry| {
            entry.touched_at = Instant::now();
            entry.properties.clone()
        });
        self.metrics.cache_lookup(hit.is_some());
        hit
    }

    /// Looks up `key` without touching recency.
    pub fn peek(&self, key: &[u8]) -> Option<Properties> {
        self.entries
            .read()
            .peek(key)
            .map(|entry| entry.properties.clone())
    }

    /// Stores `properties` under `key`. `committed` marks a value that already
    /// matches durable storage. May evict, and so flush, other entries.
    pub fn set(&self, key: Vec<u8>, properties: Properties, committed: bool) -> Result<()> {
        let len = {
            let mut entries = self.entries.write();
            entries.put(key, self.entry(properties, committed));
            entries.len()
        };
        if len > self.capacity {
            self.evict()?;
        }
        Ok(())
    }

    /// Caches a value just read from durable storage unless a newer one is present.
    pub fn populate(&self, key: Vec<u8>, properties: Properties) -> Result<()> {
        let len = {
            let mut entries = self.entries.write();
            if !entries.contains(&key) {
                entries.put(key, self.entry(properties, true));
            }
            entries.len()
        };
        if len > self.capacity {
            self.evict()?;
        }
        Ok(())
    }

    /// Drops `key` without flushing it.
    pub fn discard(&self, key: &[u8]) {
        self.entries.write().pop(key);
    }

    /// Drops every entry without flushing.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Evicts least-recently-used entries until the cache is within capacity.
    /// Returns the number of entries dropped.
    pub fn evict(&self) -> Result<usize> {
        let _guard = self.evicting.lock();
        let mut evicted = 0;
        loop {
            let candidate = {
                let entries = self.entries.read();
                if entries.len() <= self.capacity {
                    break;
                }
                match entries.peek_lru() {
                    Some((key, entry)) => Self::candidate(key, entry),
                    None => break,
                }
            };
            if self.retire(candidate)? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            trace!(evicted, "cache.evict");
        }
        Ok(evicted)
    }

    /// Evicts every entry untouched for at least `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> Result<usize> {
        let _guard = self.evicting.lock();
        let candidates: Vec<Candidate> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.touched_at.elapsed() >= max_idle)
            .map(|(key, entry)| Self::candidate(key, entry))
            .collect();
        let mut evicted = 0;
        for candidate in candidates {
            if self.retire(candidate)? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "cache.evict_idle");
        }
        Ok(evicted)
    }

    /// Writes every dirty entry through the sink and marks it committed.
    pub fn flush_all(&self) -> Result<usize> {
        let _guard = self.evicting.lock();
        let dirty: Vec<Candidate> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.committed)
            .map(|(key, entry)| Self::candidate(key, entry))
            .collect();
        let mut flushed = 0;
        for candidate in dirty {
            let Some(properties) = candidate.dirty.as_ref() else {
                continue;
            };
            self.sink.flush(&candidate.key, properties)?;
            self.metrics.cache_flush();
            flushed += 1;
            let mut entries = self.entries.write();
            if let Some(entry) = entries.peek_mut(&candidate.key) {
                // a value stored during the flush may predate it on disk
                entry.committed = entry.version == candidate.version;
            }
        }
        if flushed > 0 {
            debug!(flushed, "cache.flush_all");
        }
        Ok(flushed)
    }

    fn entry(&self, properties: Properties, committed: bool) -> CacheEntry {
        CacheEntry {
            properties,
            committed,
            touched_at: Instant::now(),
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn candidate(key: &[u8], entry: &CacheEntry) -> Candidate {
        Candidate {
            key: key.to_vec(),
            dirty: (!entry.committed).then(|| entry.properties.clone()),
            version: entry.version,
        }
    }

    // Flushes a candidate if dirty, then drops it unless it was rewritten meanwhile.
    // A rewrite that raced a flush stays dirty: the stale flush may have landed
    // after the newer value reached disk.
    fn retire(&self, candidate: Candidate) -> Result<bool> {
        if let Some(properties) = &candidate.dirty {
            self.sink.flush(&candidate.key, properties)?;
            self.metrics.cache_flush();
        }
        let mut entries = self.entries.write();
        let rewritten = match entries.peek_mut(&candidate.key) {
            None => return Ok(false),
            Some(entry) if entry.version == candidate.version => false,
            Some(entry) => {
                if candidate.dirty.is_some() {
                    entry.committed = false;
                }
                true
            }
        };
        if rewritten {
            return Ok(false);
        }
        entries.pop(&candidate.key);
        self.metrics.cache_eviction();
        Ok(true)
    }
}

enum WorkerMessage {
    Tick,
    Shutdown,
}

/// Background thread that periodically evicts idle and excess entries.
pub struct CacheWorker {
    sender: Sender<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

impl CacheWorker {
    /// Starts the worker. With `max_idle` unset only capacity eviction runs.
    pub fn spawn(
        cache: Arc<WriteBackCache>,
        interval: Duration,
        max_idle: Option<Duration>,
    ) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("ravel-cache-gc".into())
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Ok(WorkerMessage::Tick) | Err(RecvTimeoutError::Timeout) => {
                        Self::run_once(&cache, max_idle);
                    }
                    Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("cache.worker.stopped");
                        break;
                    }
                }
            })?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Requests an immediate pass.
    pub fn trigger(&self) {
        let _ = self.sender.send(WorkerMessage::Tick);
    }

    /// Stops the worker and waits for an in-flight pass to finish.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if handle.join().is_err() {
            warn!("cache.worker.panicked");
        }
    }

    fn run_once(cache: &WriteBackCache, max_idle: Option<Duration>) {
        if let Some(max_idle) = max_idle {
            if let Err(err) = cache.evict_idle(max_idle) {
                warn!(error = %err, "cache.gc.error");
            }
        }
        if let Err(err) = cache.evict() {
            warn!(error = %err, "cache.gc.error");
        }
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
