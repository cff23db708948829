//! Entity model shared by nodes and relationships.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::error::Result;
use crate::graph::Graph;

/// Property bag attached to every entity.
pub type Properties = BTreeMap<String, Value>;

/// Schema-less property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Compares two values of the same variant; mixed variants are unordered.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Builds a property bag from `(name, value)` pairs.
pub fn props<I, K, V>(pairs: I) -> Properties
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Identity of an entity inside its namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type (node label or relationship type).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Identifier, unique within the type.
    pub id: String,
}

impl EntityKey {
    /// Creates a key from a type and id.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

/// Adjacency direction as seen from the node that owns the bucket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The owning node is the relationship source.
    Outgoing,
    /// The owning node is the relationship target.
    Incoming,
}

impl Direction {
    /// The direction of the mirrored entry on the other endpoint.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }

    /// Orders `(owner, other)` into `(source, target)`.
    pub fn endpoints<'a>(self, owner: &'a EntityKey, other: &'a EntityKey) -> (&'a EntityKey, &'a EntityKey) {
        match self {
            Direction::Outgoing => (owner, other),
            Direction::Incoming => (other, owner),
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
        }
    }
}

/// Property-bag access shared by nodes and relationships.
pub trait Entity {
    /// Type of the entity.
    fn entity_type(&self) -> &str;
    /// Identifier within the type.
    fn id(&self) -> &str;
    /// Current properties.
    fn properties(&self) -> &Properties;
    /// Mutable properties; changes are local until written back through a graph.
    fn properties_mut(&mut self) -> &mut Properties;

    /// Looks up a single property.
    fn property(&self, name: &str) -> Option<&Value> {
        self.properties().get(name)
    }

    /// Sets a single property, returning the previous value.
    fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value>
    where
        Self: Sized,
    {
        self.properties_mut().insert(name.into(), value.into())
    }
}

/// A node as returned by a graph backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node type.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Node id.
    pub id: String,
    /// Node properties.
    pub properties: Properties,
}

impl Node {
    /// Creates a node value.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>, properties: Properties) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            properties,
        }
    }

    /// Identity of this node.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.type_name.clone(), self.id.clone())
    }

    /// Creates a relationship from this node and both mirrored adjacency entries.
    pub fn add_relationship<G: Graph + ?Sized>(
        &self,
        graph: &G,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
        other: &EntityKey,
        properties: Properties,
    ) -> Result<Relationship> {
        graph.add_relationship(
            &self.key(),
            direction,
            relation_type,
            relationship_id,
            other,
            properties,
        )
    }

    /// Removes a relationship owned by this node in `direction`.
    pub fn del_relationship<G: Graph + ?Sized>(
        &self,
        graph: &G,
        direction: Direction,
        relation_type: &str,
        relationship_id: &str,
    ) -> Result<()> {
        graph.del_relationship(&self.key(), direction, relation_type, relationship_id)
    }

    /// Visits the relationships of one type in one direction.
    pub fn relationships<G: Graph + ?Sized>(
        &self,
        graph: &G,
        skip: usize,
        direction: Direction,
        relation_type: &str,
        visit: &mut dyn FnMut(Relationship) -> bool,
    ) -> Result<()> {
        graph.relationships(&self.key(), skip, direction, relation_type, visit)
    }
}

impl Entity for Node {
    fn entity_type(&self) -> &str {
        &self.type_name
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

/// A relationship; endpoints are keys resolved through the graph on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship type.
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Relationship id.
    pub id: String,
    /// Source node.
    pub source: EntityKey,
    /// Target node.
    pub target: EntityKey,
    /// Relationship properties.
    pub properties: Properties,
}

impl Relationship {
    /// Identity of this relationship.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.relation_type.clone(), self.id.clone())
    }

    /// Resolves the source node.
    pub fn source_node<G: Graph + ?Sized>(&self, graph: &G) -> Result<Node> {
        graph.get_node(&self.source.type_name, &self.source.id)
    }

    /// Resolves the target node.
    pub fn target_node<G: Graph + ?Sized>(&self, graph: &G) -> Result<Node> {
        graph.get_node(&self.target.type_name, &self.target.id)
    }

    /// The endpoint opposite to `owner` for a bucket in `direction`.
    pub fn other(&self, direction: Direction) -> &EntityKey {
        match direction {
            Direction::Outgoing => &self.target,
            Direction::Incoming => &self.source,
        }
    }
}

impl Entity for Relationship {
    fn entity_type(&self) -> &str {
        &self.relation_type
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

/// Deterministic id for the edge `source -[relation_type]-> target`.
///
/// Re-creating the same logical edge yields the same id, so the graph holds at most
/// one relationship of a type between an ordered pair of nodes unless callers supply
/// their own ids.
pub fn relationship_id(source: &EntityKey, relation_type: &str, target: &EntityKey) -> String {
    let mut hasher = Xxh64::new(0);
    for part in [
        source.type_name.as_str(),
        source.id.as_str(),
        relation_type,
        target.type_name.as_str(),
        target.id.as_str(),
    ] {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.digest().to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_deserialize_untagged() {
        let bag: Properties = serde_json::from_str(r#"{"a":1,"b":"x","c":[true,null],"d":{"e":1.5}}"#).unwrap();
        assert_eq!(bag["a"], Value::Int(1));
        assert_eq!(bag["b"], Value::from("x"));
        assert_eq!(bag["c"], Value::List(vec![Value::Bool(true), Value::Null]));
        assert_eq!(
            bag["d"],
            Value::Map(props([("e", Value::Float(1.5))]))
        );
    }

    #[test]
    fn relationship_id_is_stable_and_direction_sensitive() {
        let a = EntityKey::new("user", "u1");
        let b = EntityKey::new("business", "b1");
        let forward = relationship_id(&a, "works_at", &b);
        assert_eq!(forward, relationship_id(&a, "works_at", &b));
        assert_eq!(forward.len(), 16);
        assert_ne!(forward, relationship_id(&b, "works_at", &a));
        assert_ne!(forward, relationship_id(&a, "owns", &b));
    }

    #[test]
    fn relationship_id_separates_components() {
        let a = EntityKey::new("ab", "c");
        let b = EntityKey::new("a", "bc");
        let t = EntityKey::new("x", "y");
        assert_ne!(relationship_id(&a, "r", &t), relationship_id(&b, "r", &t));
    }

    #[test]
    fn direction_orders_endpoints() {
        let owner = EntityKey::new("n", "1");
        let other = EntityKey::new("n", "2");
        assert_eq!(Direction::Outgoing.endpoints(&owner, &other), (&owner, &other));
        assert_eq!(Direction::Incoming.endpoints(&owner, &other), (&other, &owner));
        assert_eq!(Direction::Incoming.reverse(), Direction::Outgoing);
    }

    #[test]
    fn mixed_numeric_values_compare() {
        assert_eq!(
            Value::Int(2).partial_cmp_value(&Value::Float(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::from("a").partial_cmp_value(&Value::Int(1)), None);
    }
}
