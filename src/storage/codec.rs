//! Value encodings for the durable keyspace.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{EntityKey, Properties, Relationship};

/// Stored form of a relationship: endpoints plus its property bag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Source node.
    pub source: EntityKey,
    /// Target node.
    pub target: EntityKey,
    /// Relationship properties.
    #[serde(default)]
    pub properties: Properties,
}

impl RelationshipRecord {
    /// Attaches identity to the record.
    pub fn into_relationship(self, relation_type: &str, id: &str) -> Relationship {
        Relationship {
            relation_type: relation_type.to_string(),
            id: id.to_string(),
            source: self.source,
            target: self.target,
            properties: self.properties,
        }
    }
}

/// Encodes a property bag.
pub fn encode_properties(properties: &Properties) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(properties)?)
}

/// Decodes a property bag; an empty value decodes to an empty bag.
pub fn decode_properties(bytes: &[u8]) -> Result<Properties> {
    if bytes.is_empty() {
        return Ok(Properties::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encodes a relationship record.
pub fn encode_relationship(record: &RelationshipRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decodes a relationship record.
pub fn decode_relationship(bytes: &[u8]) -> Result<RelationshipRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Big-endian counter value.
pub fn encode_count(count: u64) -> [u8; 8] {
    count.to_be_bytes()
}

/// Decodes a counter, treating malformed values as zero.
pub fn decode_count(bytes: &[u8]) -> u64 {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{props, Value};

    #[test]
    fn properties_round_trip() {
        let bag = props([("name", Value::from("Ann")), ("age", Value::from(41i64))]);
        let bytes = encode_properties(&bag).unwrap();
        assert_eq!(decode_properties(&bytes).unwrap(), bag);
        assert!(decode_properties(&[]).unwrap().is_empty());
    }

    #[test]
    fn relationship_record_without_properties_decodes() {
        let json = br#"{"source":{"type":"a","id":"1"},"target":{"type":"b","id":"2"}}"#;
        let record = decode_relationship(json).unwrap();
        assert!(record.properties.is_empty());
        let rel = record.into_relationship("knows", "k1");
        assert_eq!(rel.source, EntityKey::new("a", "1"));
        assert_eq!(rel.key(), EntityKey::new("knows", "k1"));
    }

    #[test]
    fn counts_decode_defensively() {
        assert_eq!(decode_count(&encode_count(7)), 7);
        assert_eq!(decode_count(b"xx"), 0);
    }
}
