//! Replicated command format.
//!
//! A command travels as a JSON envelope `{method, payload, timestamp, metadata}`.
//! The method is decoded separately from the payload so a replica that does not know
//! a method reports [`CommandError::Unsupported`] instead of a generic parse failure.
//! Unknown envelope fields are ignored, which lets newer members add metadata
//! without breaking older ones.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{relationship_id, Direction, EntityKey, Properties};

/// Failure to decode a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The method is not known to this version.
    #[error("unsupported command method `{0}`")]
    Unsupported(String),
    /// The envelope or payload could not be decoded.
    #[error("malformed command: {0}")]
    Malformed(String),
}

/// Command discriminator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// Insert or overwrite one node.
    AddNode,
    /// Replace the properties of one node.
    SetNodeProperties,
    /// Delete one node and its relationships.
    DeleteNode,
    /// Insert or overwrite several nodes.
    BulkAdd,
    /// Replace the properties of several nodes.
    BulkSet,
    /// Delete several nodes.
    BulkDelete,
    /// Create a relationship.
    AddRelationship,
    /// Delete a relationship.
    DeleteRelationship,
    /// Replace the properties of a relationship.
    SetRelationshipProperties,
}

impl Method {
    /// Every method, in wire-name order of introduction.
    pub const ALL: [Method; 9] = [
        Method::AddNode,
        Method::SetNodeProperties,
        Method::DeleteNode,
        Method::BulkAdd,
        Method::BulkSet,
        Method::BulkDelete,
        Method::AddRelationship,
        Method::DeleteRelationship,
        Method::SetRelationshipProperties,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::AddNode => "add-node",
            Method::SetNodeProperties => "set-node-properties",
            Method::DeleteNode => "delete-node",
            Method::BulkAdd => "bulk-add",
            Method::BulkSet => "bulk-set",
            Method::BulkDelete => "bulk-delete",
            Method::AddRelationship => "add-relationship",
            Method::DeleteRelationship => "delete-relationship",
            Method::SetRelationshipProperties => "set-relationship-properties",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node identity plus properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    /// Node type.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node id.
    pub id: String,
    /// Properties to store.
    #[serde(default)]
    pub properties: Properties,
}

impl NodePayload {
    /// Creates a payload.
    pub fn new(node_type: impl Into<String>, id: impl Into<String>, properties: Properties) -> Self {
        Self {
            node_type: node_type.into(),
            id: id.into(),
            properties,
        }
    }
}

/// Relationship descriptor as seen from the node that owns it in `direction`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    /// Owning node.
    pub node: EntityKey,
    /// Direction from the owning node.
    pub direction: Direction,
    /// Relationship type.
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Opposite endpoint.
    pub other: EntityKey,
    /// Relationship id, fixed before the command is proposed.
    pub id: String,
    /// Relationship properties.
    #[serde(default)]
    pub properties: Properties,
}

/// Identifies a relationship to delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRef {
    /// Owning node.
    pub node: EntityKey,
    /// Direction from the owning node.
    pub direction: Direction,
    /// Relationship type.
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Relationship id.
    pub id: String,
}

/// New properties for an existing relationship.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipProperties {
    /// Relationship type.
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Relationship id.
    pub id: String,
    /// Replacement properties.
    #[serde(default)]
    pub properties: Properties,
}

/// The mutation a command carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// `add-node`
    AddNode(NodePayload),
    /// `set-node-properties`
    SetNodeProperties(NodePayload),
    /// `delete-node`
    DeleteNode(EntityKey),
    /// `bulk-add`
    BulkAdd(Vec<NodePayload>),
    /// `bulk-set`
    BulkSet(Vec<NodePayload>),
    /// `bulk-delete`
    BulkDelete(Vec<EntityKey>),
    /// `add-relationship`
    AddRelationship(RelationshipPayload),
    /// `delete-relationship`
    DeleteRelationship(RelationshipRef),
    /// `set-relationship-properties`
    SetRelationshipProperties(RelationshipProperties),
}

impl Operation {
    /// Discriminator of this operation.
    pub fn method(&self) -> Method {
        match self {
            Operation::AddNode(_) => Method::AddNode,
            Operation::SetNodeProperties(_) => Method::SetNodeProperties,
            Operation::DeleteNode(_) => Method::DeleteNode,
            Operation::BulkAdd(_) => Method::BulkAdd,
            Operation::BulkSet(_) => Method::BulkSet,
            Operation::BulkDelete(_) => Method::BulkDelete,
            Operation::AddRelationship(_) => Method::AddRelationship,
            Operation::DeleteRelationship(_) => Method::DeleteRelationship,
            Operation::SetRelationshipProperties(_) => Method::SetRelationshipProperties,
        }
    }

    fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Operation::AddNode(p) | Operation::SetNodeProperties(p) => serde_json::to_value(p),
            Operation::DeleteNode(k) => serde_json::to_value(k),
            Operation::BulkAdd(v) | Operation::BulkSet(v) => serde_json::to_value(v),
            Operation::BulkDelete(v) => serde_json::to_value(v),
            Operation::AddRelationship(p) => serde_json::to_value(p),
            Operation::DeleteRelationship(r) => serde_json::to_value(r),
            Operation::SetRelationshipProperties(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(method: Method, payload: serde_json::Value) -> Result<Self, CommandError> {
        fn parse<T: DeserializeOwned>(method: Method, payload: serde_json::Value) -> Result<T, CommandError> {
            serde_json::from_value(payload)
                .map_err(|err| CommandError::Malformed(format!("{method} payload: {err}")))
        }
        Ok(match method {
            Method::AddNode => Operation::AddNode(parse(method, payload)?),
            Method::SetNodeProperties => Operation::SetNodeProperties(parse(method, payload)?),
            Method::DeleteNode => Operation::DeleteNode(parse(method, payload)?),
            Method::BulkAdd => Operation::BulkAdd(parse(method, payload)?),
            Method::BulkSet => Operation::BulkSet(parse(method, payload)?),
            Method::BulkDelete => Operation::BulkDelete(parse(method, payload)?),
            Method::AddRelationship => Operation::AddRelationship(parse(method, payload)?),
            Method::DeleteRelationship => Operation::DeleteRelationship(parse(method, payload)?),
            Method::SetRelationshipProperties => {
                Operation::SetRelationshipProperties(parse(method, payload)?)
            }
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// One replicated log entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// The mutation.
    pub operation: Operation,
    /// Proposal time in unix milliseconds; informational only.
    pub timestamp: i64,
    /// Free-form annotations such as the proposing node.
    pub metadata: BTreeMap<String, String>,
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl Command {
    /// Wraps an operation stamped with the current time.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            timestamp: now_millis(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Discriminator of the carried operation.
    pub fn method(&self) -> Method {
        self.operation.method()
    }

    /// `add-node`.
    pub fn add_node(node_type: impl Into<String>, id: impl Into<String>, properties: Properties) -> Self {
        Self::new(Operation::AddNode(NodePayload::new(node_type, id, properties)))
    }

    /// `set-node-properties`.
    pub fn set_node_properties(
        node_type: impl Into<String>,
        id: impl Into<String>,
        properties: Properties,
    ) -> Self {
        Self::new(Operation::SetNodeProperties(NodePayload::new(node_type, id, properties)))
    }

    /// `delete-node`.
    pub fn delete_node(node_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(Operation::DeleteNode(EntityKey::new(node_type, id)))
    }

    /// `bulk-add`.
    pub fn bulk_add(nodes: Vec<NodePayload>) -> Self {
        Self::new(Operation::BulkAdd(nodes))
    }

    /// `bulk-set`.
    pub fn bulk_set(nodes: Vec<NodePayload>) -> Self {
        Self::new(Operation::BulkSet(nodes))
    }

    /// `bulk-delete`.
    pub fn bulk_delete(keys: Vec<EntityKey>) -> Self {
        Self::new(Operation::BulkDelete(keys))
    }

    /// `add-relationship` with the id derived from the oriented edge, so the id is
    /// fixed before the command enters the log.
    pub fn add_relationship(
        node: EntityKey,
        direction: Direction,
        relation_type: impl Into<String>,
        other: EntityKey,
        properties: Properties,
    ) -> Self {
        let relation_type = relation_type.into();
        let (source, target) = direction.endpoints(&node, &other);
        let id = relationship_id(source, &relation_type, target);
        Self::add_relationship_with_id(node, direction, relation_type, id, other, properties)
    }

    /// `add-relationship` with a caller-chosen id.
    pub fn add_relationship_with_id(
        node: EntityKey,
        direction: Direction,
        relation_type: impl Into<String>,
        id: impl Into<String>,
        other: EntityKey,
        properties: Properties,
    ) -> Self {
        Self::new(Operation::AddRelationship(RelationshipPayload {
            node,
            direction,
            relation_type: relation_type.into(),
            other,
            id: id.into(),
            properties,
        }))
    }

    /// `delete-relationship`.
    pub fn delete_relationship(
        node: EntityKey,
        direction: Direction,
        relation_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self::new(Operation::DeleteRelationship(RelationshipRef {
            node,
            direction,
            relation_type: relation_type.into(),
            id: id.into(),
        }))
    }

    /// `set-relationship-properties`.
    pub fn set_relationship_properties(
        relation_type: impl Into<String>,
        id: impl Into<String>,
        properties: Properties,
    ) -> Self {
        Self::new(Operation::SetRelationshipProperties(RelationshipProperties {
            relation_type: relation_type.into(),
            id: id.into(),
            properties,
        }))
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        let payload = self
            .operation
            .payload()
            .map_err(|err| CommandError::Malformed(err.to_string()))?;
        let envelope = Envelope {
            method: self.method().as_str().to_string(),
            payload,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        };
        serde_json::to_vec(&envelope).map_err(|err| CommandError::Malformed(err.to_string()))
    }

    /// Parses an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|err| CommandError::Malformed(format!("envelope: {err}")))?;
        let method = Method::parse(&envelope.method)
            .ok_or_else(|| CommandError::Unsupported(envelope.method.clone()))?;
        Ok(Self {
            operation: Operation::from_payload(method, envelope.payload)?,
            timestamp: envelope.timestamp,
            metadata: envelope.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::props;

    #[test]
    fn method_names_parse_back() {
        for method in Method::ALL {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("add_node"), None);
    }

    #[test]
    fn add_relationship_fixes_id_before_proposal() {
        let u1 = EntityKey::new("user", "u1");
        let b1 = EntityKey::new("business", "b1");
        let forward = Command::add_relationship(u1.clone(), Direction::Outgoing, "works_at", b1.clone(), Properties::new());
        let mirrored = Command::add_relationship(b1, Direction::Incoming, "works_at", u1, Properties::new());
        let (Operation::AddRelationship(a), Operation::AddRelationship(b)) = (&forward.operation, &mirrored.operation) else {
            panic!("expected add-relationship");
        };
        assert_eq!(a.id, b.id);
        let decoded = Command::decode(&forward.encode().unwrap()).unwrap();
        assert_eq!(decoded, forward);
    }

    #[test]
    fn envelope_is_readable_json() {
        let command = Command::add_node("x", "1", props([("a", 1i64)])).with_metadata("origin", "n1");
        let json: serde_json::Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(json["method"], "add-node");
        assert_eq!(json["payload"]["type"], "x");
        assert_eq!(json["payload"]["properties"]["a"], 1);
        assert_eq!(json["metadata"]["origin"], "n1");
    }

    #[test]
    fn unknown_method_is_unsupported() {
        let bytes = br#"{"method":"merge-graphs","payload":{},"timestamp":0}"#;
        assert!(matches!(Command::decode(bytes), Err(CommandError::Unsupported(m)) if m == "merge-graphs"));
    }

    #[test]
    fn bad_payload_is_malformed() {
        let bytes = br#"{"method":"delete-node","payload":{"type":"x"}}"#;
        assert!(matches!(Command::decode(bytes), Err(CommandError::Malformed(_))));
        assert!(matches!(Command::decode(b"not json"), Err(CommandError::Malformed(_))));
    }

    #[test]
    fn extra_envelope_fields_are_ignored() {
        let bytes = br#"{"method":"delete-node","payload":{"type":"x","id":"1"},"timestamp":5,"trace":"abc"}"#;
        let command = Command::decode(bytes).unwrap();
        assert_eq!(command.operation, Operation::DeleteNode(EntityKey::new("x", "1")));
        assert_eq!(command.timestamp, 5);
    }
}
