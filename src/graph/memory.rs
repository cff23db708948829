use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::ordered::OrderedMap;
use super::{Graph, NodeVisitor, RelationshipVisitor};
use crate::error::{GraphError, Result};
use crate::model::{Direction, EntityKey, Node, Properties, Relationship};

type Bucket = OrderedMap<String, EntityKey>;

struct NodeSlot {
    properties: Properties,
    // (direction, relation type) -> relationship id -> other endpoint
    adjacency: FxHashMap<(Direction, String), Bucket>,
}

struct RelationshipSlot {
    source: EntityKey,
    target: EntityKey,
    properties: Properties,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, OrderedMap<String, NodeSlot>>,
    relationships: BTreeMap<String, OrderedMap<String, RelationshipSlot>>,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }

    fn node(&self, key: &EntityKey) -> Result<&NodeSlot> {
        self.nodes
            .get(&key.type_name)
            .and_then(|ids| ids.get(&key.id))
            .ok_or_else(|| GraphError::node_not_found(&key.type_name, &key.id))
    }

    fn node_mut(&mut self, key: &EntityKey) -> Result<&mut NodeSlot> {
        self.nodes
            .get_mut(&key.type_name)
            .and_then(|ids| ids.get_mut(&key.id))
            .ok_or_else(|| GraphError::node_not_found(&key.type_name, &key.id))
    }

    fn relationship(&self, relation_type: &str, id: &str) -> Result<&RelationshipSlot> {
        self.relationships
            .get(relation_type)
            .and_then(|ids| ids.get(id))
            .ok_or_else(|| GraphError::relationship_not_found(relation_type, id))
    }

    fn bucket_mut(&mut self, key: &EntityKey, direction: Direction, relation_type: &str) -> Result<&mut Bucket> {
        Ok(self
            .node_mut(key)?
            .adjacency
            .entry((direction, relation_type.to_string()))
            .or_default())
    }

    fn unlink(&mut self, relation_type: &str, id: &str) -> Result<RelationshipSlot> {
        let ids = self
            .relationships
            .get_mut(relation_type)
            .ok_or_else(|| GraphError::relationship_not_found(relation_type, id))?;
        let slot = ids
            .remove(id)
            .ok_or_else(|| GraphError::relationship_not_found(relation_type, id))?;
        if ids.is_empty() {
            self.relationships.remove(relation_type);
        }
        let out_removed = self
            .node_mut(&slot.source)
            .ok()
            .and_then(|n| n.adjacency.get_mut(&(Direction::Outgoing, relation_type.to_string())))
            .and_then(|bucket| bucket.remove(id));
        let in_removed = self
            .node_mut(&slot.target)
            .ok()
            .and_then(|n| n.adjacency.get_mut(&(Direction::Incoming, relation_type.to_string())))
            .and_then(|bucket| bucket.remove(id));
        if out_removed.is_none() || in_removed.is_none() {
            return Err(GraphError::Consistency(format!(
                "relationship {relation_type}/{id} was missing a mirrored adjacency entry"
            )));
        }
        Ok(slot)
    }

    fn materialize(relation_type: &str, id: &str, slot: &RelationshipSlot) -> Relationship {
        Relationship {
            relation_type: relation_type.to_string(),
            id: id.to_string(),
            source: slot.source.clone(),
            target: slot.target.clone(),
            properties: slot.properties.clone(),
        }
    }
}

/// Reference backend keeping the whole graph in insertion-ordered containers.
///
/// One mutex guards nodes, relationships and adjacency together, so every operation
/// observes and leaves a consistent mirror. Visitors run after the lock is released
/// and may call back into the graph.
#[derive(Default)]
pub struct MemoryGraph {
    inner: Mutex<Inner>,
}

impl MemoryGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Graph for MemoryGraph {
    fn add_node(&self, node_type: &str, id: &str, properties: Properties) -> Result<Node> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let ids = inner.nodes.entry(node_type.to_string()).or_default();
        match ids.get_mut(id) {
            Some(existing) => existing.properties = properties.clone(),
            None => {
                ids.insert(
                    id.to_string(),
                    NodeSlot {
                        properties: properties.clone(),
                        adjacency: FxHashMap::default(),
                    },
                );
            }
        }
        Ok(Node::new(node_type, id, properties))
    }

    fn get_node(&self, node_type: &str, id: &str) -> Result<Node> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let slot = inner.node(&EntityKey::new(node_type, id))?;
        Ok(Node::new(node_type, id, slot.properties.clone()))
    }

    fn set_node_properties(
        &self,
        node_type: &str,
        id: &str,
        properties: Properties,
    ) -> Result<Node> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.node_mut(&EntityKey::new(node_type, id))?.properties = properties.clone();
        Ok(Node::new(node_type, id, properties))
    }

    fn del_node(&self, node_type: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let key = EntityKey::new(node_type, id);
        let attached: Vec<(String, String)> = inner
            .node(&key)?
            .adjacency
            .iter()
            .flat_map(|((_, relation_type), bucket)| {
                bucket
                    .keys()
                    .map(move |rid| (relation_type.clone(), rid.clone()))
            })
            .collect();
        for (relation_type, rid) in &attached {
            // self-loops appear in both buckets of the same node
            let still_present = inner
                .relationships
                .get(relation_type)
                .is_some_and(|ids| ids.contains_key(rid.as_str()));
            if still_present {
                inner.unlink(relation_type, rid)?;
            }
        }
        if let Some(ids) = inner.nodes.get_mut(node_type) {
            ids.remove(id);
            if ids.is_empty() {
                inner.nodes.remove(node_type);
            }
        }
        debug!(node = %key, relationships = attached.len(), "memory.del_node");
        Ok(())
    }

    fn range_nodes(&self, skip: usize, node_type: &str, visit: &mut NodeVisitor<'_>) -> Result<()> {
        let page: Vec<Node> = {
            let inner = self.inner.lock();
            inner.check_open()?;
            match inner.nodes.get(node_type) {
                Some(ids) => ids
                    .iter()
                    .skip(skip)
                    .map(|(id, slot)| Node::new(node_type, id.clone(), slot.properties.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        for node in page {
            if !visit(node) {
                break;
            }
        }
        Ok(())
    }

    fn node_types(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.nodes.keys().cloned().collect())
    }

    fn relationship_types(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.relationships.keys().cloned().collect())
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
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.node(node)?;
        inner.node(other)?;
        let (source, target) = direction.endpoints(node, other);
        if let Ok(existing) = inner.relationship(relation_type, relationship_id) {
            if &existing.source != source || &existing.target != target {
                return Err(GraphError::InvalidArgument(format!(
                    "relationship {relation_type}/{relationship_id} already connects {} to {}",
                    existing.source, existing.target
                )));
            }
        }
        inner
            .bucket_mut(source, Direction::Outgoing, relation_type)?
            .insert(relationship_id.to_string(), target.clone());
        inner
            .bucket_mut(target, Direction::Incoming, relation_type)?
            .insert(relationship_id.to_string(), source.clone());
        let slot = RelationshipSlot {
            source: source.clone(),
            target: target.clone(),
            properties,
        };
        let relationship = Inner::materialize(relation_type, relationship_id, &slot);
        inner
            .relationships
            .entry(relation_type.to_string())
            .or_default()
            .insert(relationship_id.to_string(), slot);
        Ok(relationship)
    }

    fn del_relationship(
        &self,
        node: &EntityKey,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let owned = inner
            .node(node)?
            .adjacency
            .get(&(direction, relation_type.to_string()))
            .is_some_and(|bucket| bucket.contains_key(relationship_id));
        if !owned {
            return Err(GraphError::relationship_not_found(relation_type, relationship_id));
        }
        inner.unlink(relation_type, relationship_id)?;
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
        let page: Vec<Relationship> = {
            let inner = self.inner.lock();
            inner.check_open()?;
            let slot = inner.node(node)?;
            match slot.adjacency.get(&(direction, relation_type.to_string())) {
                Some(bucket) => bucket
                    .keys()
                    .skip(skip)
                    .map(|rid| {
                        inner
                            .relationship(relation_type, rid)
                            .map(|rel| Inner::materialize(relation_type, rid, rel))
                    })
                    .collect::<Result<_>>()?,
                None => Vec::new(),
            }
        };
        for relationship in page {
            if !visit(relationship) {
                break;
            }
        }
        Ok(())
    }

    fn get_relationship(&self, relation_type: &str, id: &str) -> Result<Relationship> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let slot = inner.relationship(relation_type, id)?;
        Ok(Inner::materialize(relation_type, id, slot))
    }

    fn range_relationships(
        &self,
        skip: usize,
        relation_type: &str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()> {
        let page: Vec<Relationship> = {
            let inner = self.inner.lock();
            inner.check_open()?;
            match inner.relationships.get(relation_type) {
                Some(ids) => ids
                    .iter()
                    .skip(skip)
                    .map(|(id, slot)| Inner::materialize(relation_type, id, slot))
                    .collect(),
                None => Vec::new(),
            }
        };
        for relationship in page {
            if !visit(relationship) {
                break;
            }
        }
        Ok(())
    }

    fn set_relationship_properties(
        &self,
        relation_type: &str,
        id: &str,
        properties: Properties,
    ) -> Result<Relationship> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let slot = inner
            .relationships
            .get_mut(relation_type)
            .and_then(|ids| ids.get_mut(id))
            .ok_or_else(|| GraphError::relationship_not_found(relation_type, id))?;
        slot.properties = properties;
        Ok(Inner::materialize(relation_type, id, slot))
    }

    fn size(&self) -> Result<usize> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.nodes.values().map(OrderedMap::len).sum())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.nodes.clear();
        inner.relationships.clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.relationships.clear();
        inner.closed = true;
        Ok(())
    }
}
