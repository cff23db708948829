//! Durable [`Graph`] over an ordered key-value store.
//!
//! All records live in one `redb` table keyed by [`super::keys`]. Each mutation runs
//! in a single write transaction, so a relationship and both of its adjacency
//! entries appear or disappear together. Property bags are served through a
//! [`WriteBackCache`]; `set_*_properties` only dirties the cache and the value
//! reaches disk on eviction, [`KvGraph::flush`] or close.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadOnlyTable, ReadableDatabase, ReadableTable, Table, TableDefinition};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use super::cache::{CacheWorker, FlushSink, WriteBackCache};
use super::codec::{self, RelationshipRecord};
use super::keys::{self, KeyKind, Namespace, NODE_COUNT_KEY};
use super::metrics::{default_metrics, StorageMetrics};
use crate::error::{GraphError, Result, StorageContext};
use crate::graph::{Graph, NodeVisitor, RelationshipVisitor};
use crate::model::{Direction, EntityKey, Node, Properties, Relationship};

const GRAPH: TableDefinition<&[u8], &[u8]> = TableDefinition::new("graph");
const EMPTY: &[u8] = &[];

type ReadTable = ReadOnlyTable<&'static [u8], &'static [u8]>;
type WriteTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

trait GraphTable: ReadableTable<&'static [u8], &'static [u8]> {}

impl<T: ReadableTable<&'static [u8], &'static [u8]>> GraphTable for T {}

/// Tuning for [`KvGraph::open`].
#[derive(Clone)]
pub struct KvOptions {
    /// Maximum cached property bags.
    pub cache_capacity: usize,
    /// Period of the background eviction pass; `None` disables the worker.
    pub gc_interval: Option<Duration>,
    /// Entries idle this long are flushed and dropped by the worker.
    pub max_idle: Option<Duration>,
    /// Instrumentation sink.
    pub metrics: Arc<dyn StorageMetrics>,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            gc_interval: Some(Duration::from_secs(1)),
            max_idle: None,
            metrics: default_metrics(),
        }
    }
}

impl std::fmt::Debug for KvOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvOptions")
            .field("cache_capacity", &self.cache_capacity)
            .field("gc_interval", &self.gc_interval)
            .field("max_idle", &self.max_idle)
            .finish_non_exhaustive()
    }
}

struct Store {
    db: RwLock<Option<Arc<Database>>>,
}

impl Store {
    fn db(&self) -> Result<Arc<Database>> {
        self.db.read().clone().ok_or(GraphError::Closed)
    }

    fn read<T>(&self, op: &'static str, f: impl FnOnce(&ReadTable) -> Result<T>) -> Result<T> {
        let db = self.db()?;
        let txn = db.begin_read().during(op)?;
        let table = txn.open_table(GRAPH).during(op)?;
        f(&table)
    }

    // Commits when `f` succeeds, aborts otherwise.
    fn write<T>(&self, op: &'static str, f: impl FnOnce(&mut WriteTable<'_>) -> Result<T>) -> Result<T> {
        let db = self.db()?;
        let txn = db.begin_write().during(op)?;
        let outcome = {
            let mut table = txn.open_table(GRAPH).during(op)?;
            f(&mut table)
        };
        match outcome {
            Ok(value) => {
                txn.commit().during(op)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = txn.abort() {
                    warn!(op, error = %abort, "kv.abort.error");
                }
                Err(err)
            }
        }
    }
}

impl FlushSink for Store {
    fn flush(&self, key: &[u8], properties: &Properties) -> Result<()> {
        const OP: &str = "cache_flush";
        self.write(OP, |table| {
            // entity deleted since it was cached
            let Some(current) = get_bytes(&*table, key, OP)? else {
                return Ok(());
            };
            let bytes = match keys::classify(key) {
                Some(KeyKind::Node) => codec::encode_properties(properties)?,
                Some(KeyKind::Relationship) => {
                    let mut record = codec::decode_relationship(&current)?;
                    record.properties = properties.clone();
                    codec::encode_relationship(&record)?
                }
                _ => {
                    return Err(GraphError::InvalidArgument(format!(
                        "cache key {} does not address an entity",
                        hex::encode(key)
                    )))
                }
            };
            table.insert(key, bytes.as_slice()).during(OP)?;
            Ok(())
        })
    }
}

fn get_bytes<T: GraphTable>(table: &T, key: &[u8], op: &'static str) -> Result<Option<Vec<u8>>> {
    Ok(table.get(key).during(op)?.map(|guard| guard.value().to_vec()))
}

fn scan<T: GraphTable>(
    table: &T,
    prefix: &[u8],
    skip: usize,
    op: &'static str,
    mut visit: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()> {
    let mut skipped = 0;
    for entry in table.range(prefix..).during(op)? {
        let (key, value) = entry.during(op)?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        if skipped < skip {
            skipped += 1;
            continue;
        }
        if !visit(key, value.value())? {
            break;
        }
    }
    Ok(())
}

fn scan_keys<T: GraphTable>(table: &T, prefix: &[u8], op: &'static str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    scan(table, prefix, 0, op, |key, _| {
        out.push(key.to_vec());
        Ok(true)
    })?;
    Ok(out)
}

fn adjust(table: &mut WriteTable<'_>, key: &[u8], delta: i64, op: &'static str) -> Result<u64> {
    let current = get_bytes(&*table, key, op)?
        .map(|bytes| codec::decode_count(&bytes))
        .unwrap_or_default();
    let next = current.saturating_add_signed(delta);
    if next == 0 {
        table.remove(key).during(op)?;
    } else {
        table.insert(key, codec::encode_count(next).as_slice()).during(op)?;
    }
    Ok(next)
}

fn require_node<T: GraphTable>(table: &T, node: &EntityKey, op: &'static str) -> Result<()> {
    match get_bytes(table, &keys::node_key(&node.type_name, &node.id), op)? {
        Some(_) => Ok(()),
        None => Err(GraphError::node_not_found(&node.type_name, &node.id)),
    }
}

fn missing_mirror(relation_type: &str, id: &str, side: &EntityKey) -> GraphError {
    GraphError::Consistency(format!(
        "relationship {relation_type}/{id} has no adjacency entry on {side}"
    ))
}

/// Graph stored in a `redb` database file.
pub struct KvGraph {
    path: PathBuf,
    store: Arc<Store>,
    cache: Arc<WriteBackCache>,
    worker: Mutex<Option<CacheWorker>>,
    // serializes mutations so existence checks and cache updates pair up
    writer: Mutex<()>,
    metrics: Arc<dyn StorageMetrics>,
}

impl KvGraph {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: KvOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&path).during("open")?;
        let txn = db.begin_write().during("open")?;
        txn.open_table(GRAPH).during("open")?;
        txn.commit().during("open")?;

        let store = Arc::new(Store {
            db: RwLock::new(Some(Arc::new(db))),
        });
        let cache = Arc::new(WriteBackCache::new(
            options.cache_capacity,
            store.clone(),
            options.metrics.clone(),
        ));
        let worker = match options.gc_interval {
            Some(interval) => Some(CacheWorker::spawn(cache.clone(), interval, options.max_idle)?),
            None => None,
        };
        info!(path = %path.display(), capacity = cache.capacity(), "kv.open");
        Ok(Self {
            path,
            store,
            cache,
            worker: Mutex::new(worker),
            writer: Mutex::new(()),
            metrics: options.metrics,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every dirty cached property bag to disk.
    pub fn flush(&self) -> Result<usize> {
        self.store.db()?;
        self.cache.flush_all()
    }

    /// Number of property bags currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn node_exists(&self, key: &[u8]) -> Result<bool> {
        if self.cache.peek(key).is_some() {
            return Ok(true);
        }
        self.store
            .read("node_exists", |table| Ok(get_bytes(table, key, "node_exists")?.is_some()))
    }

    fn relationship_record(&self, relation_type: &str, id: &str, op: &'static str) -> Result<RelationshipRecord> {
        let key = keys::relationship_key(relation_type, id);
        let bytes = self
            .store
            .read(op, |table| get_bytes(table, &key, op))?
            .ok_or_else(|| GraphError::relationship_not_found(relation_type, id))?;
        codec::decode_relationship(&bytes)
    }

    // Cached properties win over the stored copy.
    fn overlay(&self, key: &[u8], stored: Properties) -> Properties {
        self.cache.peek(key).unwrap_or(stored)
    }

    fn scan_relationships<T: GraphTable>(
        &self,
        table: &T,
        prefix: &[u8],
        skip: usize,
        op: &'static str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()> {
        scan(table, prefix, skip, op, |key, value| {
            let identity = keys::decode_relationship_key(key)
                .ok_or_else(|| GraphError::Serialization(format!("bad relationship key {}", hex::encode(key))))?;
            let mut record = codec::decode_relationship(value)?;
            record.properties = self.overlay(key, record.properties);
            Ok(visit(record.into_relationship(&identity.type_name, &identity.id)))
        })
    }
}

impl Graph for KvGraph {
    fn add_node(&self, node_type: &str, id: &str, properties: Properties) -> Result<Node> {
        const OP: &str = "add_node";
        let _writer = self.writer.lock();
        let key = keys::node_key(node_type, id);
        let bytes = codec::encode_properties(&properties)?;
        let created = self.store.write(OP, |table| {
            let existed = table.insert(key.as_slice(), bytes.as_slice()).during(OP)?.is_some();
            if !existed {
                adjust(table, NODE_COUNT_KEY, 1, OP)?;
                adjust(table, &keys::type_key(Namespace::Node, node_type), 1, OP)?;
            }
            Ok(!existed)
        })?;
        self.cache.set(key, properties.clone(), true)?;
        if created {
            self.metrics.node_created();
        }
        Ok(Node::new(node_type, id, properties))
    }

    fn get_node(&self, node_type: &str, id: &str) -> Result<Node> {
        self.store.db()?;
        let key = keys::node_key(node_type, id);
        if let Some(properties) = self.cache.get(&key) {
            return Ok(Node::new(node_type, id, properties));
        }
        // read and populate under the writer so a delete cannot land in between
        let _writer = self.writer.lock();
        if let Some(properties) = self.cache.get(&key) {
            return Ok(Node::new(node_type, id, properties));
        }
        let bytes = self
            .store
            .read("get_node", |table| get_bytes(table, &key, "get_node"))?
            .ok_or_else(|| GraphError::node_not_found(node_type, id))?;
        let properties = codec::decode_properties(&bytes)?;
        self.cache.populate(key, properties.clone())?;
        Ok(Node::new(node_type, id, properties))
    }

    fn set_node_properties(
        &self,
        node_type: &str,
        id: &str,
        properties: Properties,
    ) -> Result<Node> {
        let _writer = self.writer.lock();
        let key = keys::node_key(node_type, id);
        if !self.node_exists(&key)? {
            return Err(GraphError::node_not_found(node_type, id));
        }
        self.cache.set(key, properties.clone(), false)?;
        Ok(Node::new(node_type, id, properties))
    }

    fn del_node(&self, node_type: &str, id: &str) -> Result<()> {
        const OP: &str = "del_node";
        let _writer = self.writer.lock();
        let owner = EntityKey::new(node_type, id);
        let node_key = keys::node_key(node_type, id);
        let removed = self.store.write(OP, |table| {
            if table.remove(node_key.as_slice()).during(OP)?.is_none() {
                return Err(GraphError::node_not_found(node_type, id));
            }
            let mut removed: FxHashSet<(String, String)> = FxHashSet::default();
            for adjacency in scan_keys(&*table, &keys::adjacency_node_prefix(&owner), OP)? {
                let entry = keys::decode_adjacency_key(&adjacency).ok_or_else(|| {
                    GraphError::Serialization(format!("bad adjacency key {}", hex::encode(&adjacency)))
                })?;
                table.remove(adjacency.as_slice()).during(OP)?;
                let identity = (entry.relation_type.clone(), entry.relationship_id.clone());
                if removed.contains(&identity) {
                    continue;
                }
                let mirror = keys::adjacency_key(
                    &entry.other,
                    entry.direction.reverse(),
                    &entry.relation_type,
                    &owner,
                    &entry.relationship_id,
                );
                if table.remove(mirror.as_slice()).during(OP)?.is_none() {
                    return Err(missing_mirror(&entry.relation_type, &entry.relationship_id, &entry.other));
                }
                let relationship = keys::relationship_key(&entry.relation_type, &entry.relationship_id);
                if table.remove(relationship.as_slice()).during(OP)?.is_none() {
                    return Err(GraphError::Consistency(format!(
                        "adjacency on {owner} references missing relationship {}/{}",
                        entry.relation_type, entry.relationship_id
                    )));
                }
                adjust(table, &keys::type_key(Namespace::Relationship, &entry.relation_type), -1, OP)?;
                removed.insert(identity);
            }
            adjust(table, NODE_COUNT_KEY, -1, OP)?;
            adjust(table, &keys::type_key(Namespace::Node, node_type), -1, OP)?;
            Ok(removed)
        })?;
        self.cache.discard(&node_key);
        for (relation_type, rid) in &removed {
            self.cache.discard(&keys::relationship_key(relation_type, rid));
            self.metrics.relationship_deleted();
        }
        self.metrics.node_deleted();
        debug!(node = %owner, relationships = removed.len(), "kv.del_node");
        Ok(())
    }

    fn range_nodes(&self, skip: usize, node_type: &str, visit: &mut NodeVisitor<'_>) -> Result<()> {
        const OP: &str = "range_nodes";
        self.store.read(OP, |table| {
            scan(table, &keys::node_prefix(node_type), skip, OP, |key, value| {
                let identity = keys::decode_node_key(key)
                    .ok_or_else(|| GraphError::Serialization(format!("bad node key {}", hex::encode(key))))?;
                let properties = match self.cache.peek(key) {
                    Some(cached) => cached,
                    None => codec::decode_properties(value)?,
                };
                Ok(visit(Node::new(identity.type_name, identity.id, properties)))
            })
        })
    }

    fn node_types(&self) -> Result<Vec<String>> {
        registered_types(&self.store, Namespace::Node)
    }

    fn relationship_types(&self) -> Result<Vec<String>> {
        registered_types(&self.store, Namespace::Relationship)
    }

    fn add_relationship(
        &self,
        node: &EntityKey,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
        other: &EntityKey,
        properties: Properties,
    ) -> Result<Relationship> {
        const OP: &str = "add_relationship";
        let _writer = self.writer.lock();
        let (source, target) = direction.endpoints(node, other);
        let key = keys::relationship_key(relation_type, relationship_id);
        let record = RelationshipRecord {
            source: source.clone(),
            target: target.clone(),
            properties,
        };
        let encoded = codec::encode_relationship(&record)?;
        let created = self.store.write(OP, |table| {
            require_node(&*table, source, OP)?;
            require_node(&*table, target, OP)?;
            let existing = get_bytes(&*table, &key, OP)?;
            if let Some(bytes) = &existing {
                let current = codec::decode_relationship(bytes)?;
                if &current.source != source || &current.target != target {
                    return Err(GraphError::InvalidArgument(format!(
                        "relationship {relation_type}/{relationship_id} already connects {} to {}",
                        current.source, current.target
                    )));
                }
            }
            table.insert(key.as_slice(), encoded.as_slice()).during(OP)?;
            let outgoing = keys::adjacency_key(source, Direction::Outgoing, relation_type, target, relationship_id);
            let incoming = keys::adjacency_key(target, Direction::Incoming, relation_type, source, relationship_id);
            table.insert(outgoing.as_slice(), EMPTY).during(OP)?;
            table.insert(incoming.as_slice(), EMPTY).during(OP)?;
            if existing.is_none() {
                adjust(table, &keys::type_key(Namespace::Relationship, relation_type), 1, OP)?;
            }
            Ok(existing.is_none())
        })?;
        self.cache.set(key, record.properties.clone(), true)?;
        if created {
            self.metrics.relationship_created();
        }
        Ok(record.into_relationship(relation_type, relationship_id))
    }

    fn del_relationship(
        &self,
        node: &EntityKey,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
    ) -> Result<()> {
        const OP: &str = "del_relationship";
        let _writer = self.writer.lock();
        let key = keys::relationship_key(relation_type, relationship_id);
        self.store.write(OP, |table| {
            let bytes = get_bytes(&*table, &key, OP)?
                .ok_or_else(|| GraphError::relationship_not_found(relation_type, relationship_id))?;
            let record = codec::decode_relationship(&bytes)?;
            let owner = match direction {
                Direction::Outgoing => &record.source,
                Direction::Incoming => &record.target,
            };
            if owner != node {
                return Err(GraphError::relationship_not_found(relation_type, relationship_id));
            }
            table.remove(key.as_slice()).during(OP)?;
            let outgoing = keys::adjacency_key(
                &record.source,
                Direction::Outgoing,
                relation_type,
                &record.target,
                relationship_id,
            );
            if table.remove(outgoing.as_slice()).during(OP)?.is_none() {
                return Err(missing_mirror(relation_type, relationship_id, &record.source));
            }
            let incoming = keys::adjacency_key(
                &record.target,
                Direction::Incoming,
                relation_type,
                &record.source,
                relationship_id,
            );
            if table.remove(incoming.as_slice()).during(OP)?.is_none() {
                return Err(missing_mirror(relation_type, relationship_id, &record.target));
            }
            adjust(table, &keys::type_key(Namespace::Relationship, relation_type), -1, OP)?;
            Ok(())
        })?;
        self.cache.discard(&key);
        self.metrics.relationship_deleted();
        Ok(())
    }

    fn relationships(
        &self,
        node: &EntityKey,
        skip: usize,
        direction: Direction,
        relation_type: &str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()> {
        const OP: &str = "relationships";
        self.metrics.adjacency_scan(direction.as_str());
        self.store.read(OP, |table| {
            require_node(table, node, OP)?;
            let prefix = keys::adjacency_prefix(node, direction, relation_type);
            scan(table, &prefix, skip, OP, |key, _| {
                let entry = keys::decode_adjacency_key(key)
                    .ok_or_else(|| GraphError::Serialization(format!("bad adjacency key {}", hex::encode(key))))?;
                let relationship = keys::relationship_key(relation_type, &entry.relationship_id);
                let bytes = get_bytes(table, &relationship, OP)?.ok_or_else(|| {
                    GraphError::Consistency(format!(
                        "adjacency on {node} references missing relationship {relation_type}/{}",
                        entry.relationship_id
                    ))
                })?;
                let mut record = codec::decode_relationship(&bytes)?;
                record.properties = self.overlay(&relationship, record.properties);
                Ok(visit(record.into_relationship(relation_type, &entry.relationship_id)))
            })
        })
    }

    fn get_relationship(&self, relation_type: &str, id: &str) -> Result<Relationship> {
        const OP: &str = "get_relationship";
        let key = keys::relationship_key(relation_type, id);
        let record = self.relationship_record(relation_type, id, OP)?;
        if let Some(cached) = self.cache.get(&key) {
            let mut relationship = record.into_relationship(relation_type, id);
            relationship.properties = cached;
            return Ok(relationship);
        }
        let _writer = self.writer.lock();
        let record = self.relationship_record(relation_type, id, OP)?;
        let mut relationship = record.into_relationship(relation_type, id);
        match self.cache.get(&key) {
            Some(cached) => relationship.properties = cached,
            None => self.cache.populate(key, relationship.properties.clone())?,
        }
        Ok(relationship)
    }

    fn range_relationships(
        &self,
        skip: usize,
        relation_type: &str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()> {
        const OP: &str = "range_relationships";
        self.store.read(OP, |table| {
            self.scan_relationships(table, &keys::relationship_prefix(relation_type), skip, OP, visit)
        })
    }

    fn set_relationship_properties(
        &self,
        relation_type: &str,
        id: &str,
        properties: Properties,
    ) -> Result<Relationship> {
        let _writer = self.writer.lock();
        let record = self.relationship_record(relation_type, id, "set_relationship_properties")?;
        self.cache.set(
            keys::relationship_key(relation_type, id),
            properties.clone(),
            false,
        )?;
        let mut relationship = record.into_relationship(relation_type, id);
        relationship.properties = properties;
        Ok(relationship)
    }

    fn size(&self) -> Result<usize> {
        self.store.read("size", |table| {
            let count = get_bytes(table, NODE_COUNT_KEY, "size")?
                .map(|bytes| codec::decode_count(&bytes))
                .unwrap_or_default();
            Ok(count as usize)
        })
    }

    fn clear(&self) -> Result<()> {
        const OP: &str = "clear";
        let _writer = self.writer.lock();
        let removed = self.store.write(OP, |table| {
            let all = scan_keys(&*table, EMPTY, OP)?;
            for key in &all {
                table.remove(key.as_slice()).during(OP)?;
            }
            Ok(all.len())
        })?;
        self.cache.clear();
        info!(keys = removed, "kv.clear");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
        let _writer = self.writer.lock();
        if self.store.db.read().is_none() {
            return Ok(());
        }
        let flushed = self.cache.flush_all();
        self.cache.clear();
        self.store.db.write().take();
        let flushed = flushed?;
        info!(path = %self.path.display(), flushed, "kv.close");
        Ok(())
    }
}

fn registered_types(store: &Store, namespace: Namespace) -> Result<Vec<String>> {
    const OP: &str = "types";
    store.read(OP, |table| {
        let mut names = Vec::new();
        scan(table, &keys::type_prefix(namespace), 0, OP, |key, _| {
            if let Some((_, name)) = keys::decode_type_key(key) {
                names.push(name);
            }
            Ok(true)
        })?;
        Ok(names)
    })
}

impl Drop for KvGraph {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "kv.close.error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{page_nodes, page_relationships};
    use crate::model::{props, Value};
    use crate::storage::metrics::CounterMetrics;
    use tempfile::tempdir;

    fn options(capacity: usize, metrics: Arc<CounterMetrics>) -> KvOptions {
        KvOptions {
            cache_capacity: capacity,
            gc_interval: None,
            max_idle: None,
            metrics,
        }
    }

    #[test]
    fn works_at_scenario() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        let u1 = graph.add_node("user", "u1", props([("name", "Ann")])).unwrap();
        let b1 = graph.add_node("business", "b1", Properties::new()).unwrap();
        u1.add_relationship(&graph, Direction::Outgoing, "works_at", "r1", &b1.key(), Properties::new())
            .unwrap();
        let out = page_relationships(&graph, &u1.key(), Direction::Outgoing, "works_at", 0, 10).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target.id, "b1");
        let incoming = page_relationships(&graph, &b1.key(), Direction::Incoming, "works_at", 0, 10).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source.id, "u1");
        assert_eq!(graph.size().unwrap(), 2);
        assert_eq!(graph.node_types().unwrap(), vec!["business", "user"]);
        assert_eq!(graph.relationship_types().unwrap(), vec!["works_at"]);
    }

    #[test]
    fn del_node_removes_both_mirrors_and_counts() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        let a = graph.add_node("n", "a", Properties::new()).unwrap();
        let b = graph.add_node("n", "b", Properties::new()).unwrap();
        a.add_relationship(&graph, Direction::Outgoing, "knows", "k1", &b.key(), Properties::new())
            .unwrap();
        a.add_relationship(&graph, Direction::Outgoing, "self", "s1", &a.key(), Properties::new())
            .unwrap();
        graph.del_node("n", "a").unwrap();
        assert!(graph.get_node("n", "a").unwrap_err().is_not_found());
        assert!(page_relationships(&graph, &b.key(), Direction::Incoming, "knows", 0, 10)
            .unwrap()
            .is_empty());
        assert!(graph.get_relationship("knows", "k1").unwrap_err().is_not_found());
        assert_eq!(graph.size().unwrap(), 1);
        assert!(graph.relationship_types().unwrap().is_empty());
    }

    #[test]
    fn dirty_properties_reach_disk_on_eviction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.redb");
        let metrics = Arc::new(CounterMetrics::default());
        {
            let graph = KvGraph::open(&path, options(1, metrics.clone())).unwrap();
            graph.add_node("n", "a", props([("v", 1i64)])).unwrap();
            graph.add_node("n", "b", Properties::new()).unwrap();
            graph.set_node_properties("n", "a", props([("v", 2i64)])).unwrap();
            assert_eq!(metrics.flushes(), 0);
            graph.get_node("n", "b").unwrap();
            assert_eq!(metrics.flushes(), 1);
            graph.set_node_properties("n", "b", props([("v", 3i64)])).unwrap();
            graph.close().unwrap();
        }
        let graph = KvGraph::open(&path, options(8, Arc::new(CounterMetrics::default()))).unwrap();
        assert_eq!(graph.get_node("n", "a").unwrap().properties["v"], Value::Int(2));
        assert_eq!(graph.get_node("n", "b").unwrap().properties["v"], Value::Int(3));
    }

    #[test]
    fn committed_entries_are_not_rewritten() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(CounterMetrics::default());
        let graph = KvGraph::open(dir.path().join("graph.redb"), options(1, metrics.clone())).unwrap();
        for id in ["a", "b", "c"] {
            graph.add_node("n", id, Properties::new()).unwrap();
        }
        for id in ["a", "b", "c"] {
            graph.get_node("n", id).unwrap();
        }
        assert_eq!(metrics.flushes(), 0);
    }

    #[test]
    fn relationship_properties_are_cached_then_flushed() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        let a = graph.add_node("n", "a", Properties::new()).unwrap();
        let b = graph.add_node("n", "b", Properties::new()).unwrap();
        a.add_relationship(&graph, Direction::Outgoing, "knows", "k1", &b.key(), Properties::new())
            .unwrap();
        graph
            .set_relationship_properties("knows", "k1", props([("since", 2020i64)]))
            .unwrap();
        let seen = page_relationships(&graph, &b.key(), Direction::Incoming, "knows", 0, 1).unwrap();
        assert_eq!(seen[0].properties["since"], Value::Int(2020));
        assert_eq!(graph.flush().unwrap(), 1);
        assert_eq!(graph.flush().unwrap(), 0);
    }

    #[test]
    fn range_nodes_is_key_ordered_and_paged() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        for id in ["c", "a", "b"] {
            graph.add_node("t", id, Properties::new()).unwrap();
        }
        graph.add_node("tt", "x", Properties::new()).unwrap();
        let ids: Vec<_> = page_nodes(&graph, "t", 0, 10)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let second = page_nodes(&graph, "t", 2, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "c");
    }

    #[test]
    fn missing_endpoint_aborts_relationship() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        let a = graph.add_node("n", "a", Properties::new()).unwrap();
        let ghost = EntityKey::new("n", "ghost");
        let err = a
            .add_relationship(&graph, Direction::Outgoing, "knows", "k1", &ghost, Properties::new())
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(page_relationships(&graph, &a.key(), Direction::Outgoing, "knows", 0, 10)
            .unwrap()
            .is_empty());
        assert!(graph.relationship_types().unwrap().is_empty());
    }

    #[test]
    fn reads_racing_deletes_never_revive_a_node() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(KvGraph::open(dir.path().join("graph.redb"), options(2, Arc::default())).unwrap());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let graph = graph.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let _ = graph.get_node("n", "a");
                    let _ = graph.get_relationship("r", "x");
                }
            })
        };
        for i in 0..200i64 {
            graph.add_node("n", "a", props([("v", i)])).unwrap();
            graph.add_node("n", "b", Properties::new()).unwrap();
            graph
                .add_relationship(
                    &EntityKey::new("n", "a"),
                    Direction::Outgoing,
                    "r",
                    "x",
                    &EntityKey::new("n", "b"),
                    Properties::new(),
                )
                .unwrap();
            graph.del_node("n", "a").unwrap();
            assert!(graph.get_node("n", "a").unwrap_err().is_not_found(), "round {i}");
            assert!(graph.get_relationship("r", "x").unwrap_err().is_not_found(), "round {i}");
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        reader.join().unwrap();

        let err = graph.set_node_properties("n", "a", props([("v", -1i64)])).unwrap_err();
        assert!(err.is_not_found());
        graph.flush().unwrap();
        assert_eq!(graph.size().unwrap(), 1);
        assert!(graph.get_node("n", "a").unwrap_err().is_not_found());
    }

    #[test]
    fn clear_and_close() {
        let dir = tempdir().unwrap();
        let graph = KvGraph::open(dir.path().join("graph.redb"), KvOptions::default()).unwrap();
        graph.add_node("n", "a", Properties::new()).unwrap();
        graph.clear().unwrap();
        assert_eq!(graph.size().unwrap(), 0);
        assert!(graph.node_types().unwrap().is_empty());
        graph.close().unwrap();
        graph.close().unwrap();
        assert!(matches!(graph.get_node("n", "a"), Err(GraphError::Closed)));
        assert!(matches!(graph.size(), Err(GraphError::Closed)));
    }
}
