//! Backend-independent graph contract.
//!
//! A [`Graph`] owns a node namespace (type → id), a relationship namespace
//! (relation type → id) and the adjacency index that mirrors every relationship on
//! both endpoints. Two implementations exist: [`MemoryGraph`], the insertion-ordered
//! reference backend, and [`crate::storage::KvGraph`], which lays the same model out
//! over an ordered durable key-value store.
//!
//! Range operations page with a plain `skip` offset and a visitor that returns
//! `false` to stop early.

mod memory;
pub mod ordered;

pub use memory::MemoryGraph;
pub use ordered::OrderedMap;

use crate::error::Result;
use crate::model::{Direction, EntityKey, Node, Properties, Relationship};

/// Visitor invoked for each node produced by a range scan.
pub type NodeVisitor<'a> = dyn FnMut(Node) -> bool + 'a;

/// Visitor invoked for each relationship produced by a scan.
pub type RelationshipVisitor<'a> = dyn FnMut(Relationship) -> bool + 'a;

/// The aggregate graph contract consumed by the state machine and front-ends.
pub trait Graph: Send + Sync {
    /// Inserts a node; an existing `(type, id)` has its properties overwritten and
    /// keeps its adjacency.
    fn add_node(&self, node_type: &str, id: &str, properties: Properties) -> Result<Node>;

    /// Fetches a node.
    fn get_node(&self, node_type: &str, id: &str) -> Result<Node>;

    /// Replaces the property bag of an existing node.
    fn set_node_properties(&self, node_type: &str, id: &str, properties: Properties)
        -> Result<Node>;

    /// Deletes a node together with every relationship that touches it.
    fn del_node(&self, node_type: &str, id: &str) -> Result<()>;

    /// Visits nodes of `node_type` after skipping `skip` of them.
    fn range_nodes(&self, skip: usize, node_type: &str, visit: &mut NodeVisitor<'_>)
        -> Result<()>;

    /// Sorted node types known to the graph.
    fn node_types(&self) -> Result<Vec<String>>;

    /// Sorted relationship types known to the graph.
    fn relationship_types(&self) -> Result<Vec<String>>;

    /// Creates a relationship owned by `node` in `direction` towards `other`, writing
    /// the relationship and both mirrored adjacency entries as one unit.
    fn add_relationship(
        &self,
        node: &EntityKey,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
        other: &EntityKey,
        properties: Properties,
    ) -> Result<Relationship>;

    /// Removes a relationship owned by `node` in `direction` and both mirrored entries.
    fn del_relationship(
        &self,
        node: &EntityKey,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
    ) -> Result<()>;

    /// Visits the `relation_type` relationships of `node` in `direction`.
    fn relationships(
        &self,
        node: &EntityKey,
        skip: usize,
        direction: Direction,
        relation_type: &str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()>;

    /// Fetches a relationship.
    fn get_relationship(&self, relation_type: &str, id: &str) -> Result<Relationship>;

    /// Visits relationships of `relation_type` after skipping `skip` of them.
    fn range_relationships(
        &self,
        skip: usize,
        relation_type: &str,
        visit: &mut RelationshipVisitor<'_>,
    ) -> Result<()>;

    /// Replaces the property bag of an existing relationship.
    fn set_relationship_properties(
        &self,
        relation_type: &str,
        id: &str,
        properties: Properties,
    ) -> Result<Relationship>;

    /// Total node count across all types.
    fn size(&self) -> Result<usize>;

    /// Drops every node, relationship and adjacency entry.
    fn clear(&self) -> Result<()>;

    /// Releases backend resources. Later calls fail with [`crate::GraphError::Closed`].
    fn close(&self) -> Result<()>;
}

/// Collects one page of nodes; a convenience over [`Graph::range_nodes`].
pub fn page_nodes<G: Graph + ?Sized>(
    graph: &G,
    node_type: &str,
    skip: usize,
    limit: usize,
) -> Result<Vec<Node>> {
    let mut page = Vec::with_capacity(limit.min(1024));
    if limit == 0 {
        return Ok(page);
    }
    graph.range_nodes(skip, node_type, &mut |node| {
        page.push(node);
        page.len() < limit
    })?;
    Ok(page)
}

/// Collects one page of adjacency; a convenience over [`Graph::relationships`].
pub fn page_relationships<G: Graph + ?Sized>(
    graph: &G,
    node: &EntityKey,
    direction: Direction,
    relation_type: &str,
    skip: usize,
    limit: usize,
) -> Result<Vec<Relationship>> {
    let mut page = Vec::with_capacity(limit.min(1024));
    if limit == 0 {
        return Ok(page);
    }
    graph.relationships(node, skip, direction, relation_type, &mut |rel| {
        page.push(rel);
        page.len() < limit
    })?;
    Ok(page)
}
