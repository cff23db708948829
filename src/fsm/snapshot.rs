//! Point-in-time image of a graph.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::Graph;
use crate::model::{Direction, Node, Relationship};

/// Every node and relationship of a graph. Adjacency is implied by the
/// relationship endpoints and rebuilt on restore.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Nodes grouped by type, in backend scan order.
    pub nodes: Vec<Node>,
    /// Relationships grouped by type, in backend scan order.
    pub relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    /// Reads the whole graph through its public contract.
    pub fn capture<G: Graph + ?Sized>(graph: &G) -> Result<Self> {
        let mut snapshot = Self::default();
        for node_type in graph.node_types()? {
            graph.range_nodes(0, &node_type, &mut |node| {
                snapshot.nodes.push(node);
                true
            })?;
        }
        for relation_type in graph.relationship_types()? {
            graph.range_relationships(0, &relation_type, &mut |relationship| {
                snapshot.relationships.push(relationship);
                true
            })?;
        }
        Ok(snapshot)
    }

    /// Clears `graph` and loads this image into it.
    pub fn restore_into<G: Graph + ?Sized>(&self, graph: &G) -> Result<()> {
        graph.clear()?;
        for node in &self.nodes {
            graph.add_node(&node.type_name, &node.id, node.properties.clone())?;
        }
        for rel in &self.relationships {
            graph.add_relationship(
                &rel.source,
                Direction::Outgoing,
                &rel.relation_type,
                &rel.id,
                &rel.target,
                rel.properties.clone(),
            )?;
        }
        Ok(())
    }

    /// JSON encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses [`GraphSnapshot::to_bytes`] output; empty input is an empty graph.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
