//! Byte layout of the durable graph keyspace.
//!
//! Every key starts with a one-byte tag followed by string components. A component
//! is written with each `0x00` escaped as `0x00 0xFF` and closed by `0x00 0x01`, so
//! a complete component never prefixes a different one and byte order matches
//! string order. That makes "all nodes of a type" and "all relationships of a type
//! leaving a node" plain prefix scans.
//!
//! ```text
//! n <type> <id>                                              node -> properties
//! r <type> <id>                                              relationship -> record
//! a <owner type> <owner id> o|i <rel type> <other type> <other id> <rel id>
//! t n|r <type>                                               type registry -> count
//! m node_count                                               total node count
//! ```

use crate::model::{Direction, EntityKey};

const TAG_NODE: u8 = b'n';
const TAG_RELATIONSHIP: u8 = b'r';
const TAG_ADJACENCY: u8 = b'a';
const TAG_TYPE: u8 = b't';
const TAG_META: u8 = b'm';

const DIR_OUT: u8 = b'o';
const DIR_IN: u8 = b'i';

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

/// Key holding the total node count.
pub const NODE_COUNT_KEY: &[u8] = b"mnode_count";

/// Namespace a registered type belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// Node types.
    Node,
    /// Relationship types.
    Relationship,
}

impl Namespace {
    fn tag(self) -> u8 {
        match self {
            Namespace::Node => TAG_NODE,
            Namespace::Relationship => TAG_RELATIONSHIP,
        }
    }
}

/// Kind of record a key addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// A node property bag.
    Node,
    /// A relationship record.
    Relationship,
    /// One side of a mirrored adjacency pair.
    Adjacency,
    /// A type registry entry.
    Type,
    /// Bookkeeping.
    Meta,
}

/// Classifies a key by its tag byte.
pub fn classify(key: &[u8]) -> Option<KeyKind> {
    match *key.first()? {
        TAG_NODE => Some(KeyKind::Node),
        TAG_RELATIONSHIP => Some(KeyKind::Relationship),
        TAG_ADJACENCY => Some(KeyKind::Adjacency),
        TAG_TYPE => Some(KeyKind::Type),
        TAG_META => Some(KeyKind::Meta),
        _ => None,
    }
}

fn push_component(buf: &mut Vec<u8>, component: &str) {
    for &byte in component.as_bytes() {
        buf.push(byte);
        if byte == ESCAPE {
            buf.push(ESCAPED_NUL);
        }
    }
    buf.push(ESCAPE);
    buf.push(TERMINATOR);
}

fn direction_byte(direction: Direction) -> u8 {
    match direction {
        Direction::Outgoing => DIR_OUT,
        Direction::Incoming => DIR_IN,
    }
}

fn with_tag(tag: u8, capacity: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + capacity);
    buf.push(tag);
    buf
}

/// `n <type>`: prefix of every node of one type.
pub fn node_prefix(node_type: &str) -> Vec<u8> {
    let mut buf = with_tag(TAG_NODE, node_type.len() + 2);
    push_component(&mut buf, node_type);
    buf
}

/// `n <type> <id>`.
pub fn node_key(node_type: &str, id: &str) -> Vec<u8> {
    let mut buf = node_prefix(node_type);
    push_component(&mut buf, id);
    buf
}

/// `r <type>`: prefix of every relationship of one type.
pub fn relationship_prefix(relation_type: &str) -> Vec<u8> {
    let mut buf = with_tag(TAG_RELATIONSHIP, relation_type.len() + 2);
    push_component(&mut buf, relation_type);
    buf
}

/// `r <type> <id>`.
pub fn relationship_key(relation_type: &str, id: &str) -> Vec<u8> {
    let mut buf = relationship_prefix(relation_type);
    push_component(&mut buf, id);
    buf
}

/// `a <owner>`: prefix of every adjacency entry owned by a node.
pub fn adjacency_node_prefix(owner: &EntityKey) -> Vec<u8> {
    let mut buf = with_tag(TAG_ADJACENCY, owner.type_name.len() + owner.id.len() + 4);
    push_component(&mut buf, &owner.type_name);
    push_component(&mut buf, &owner.id);
    buf
}

/// `a <owner> <dir> <rel type>`: one adjacency bucket.
pub fn adjacency_prefix(owner: &EntityKey, direction: Direction, relation_type: &str) -> Vec<u8> {
    let mut buf = adjacency_node_prefix(owner);
    buf.push(direction_byte(direction));
    push_component(&mut buf, relation_type);
    buf
}

/// Full adjacency key for one side of a relationship.
pub fn adjacency_key(
    owner: &EntityKey,
    direction: Direction,
    relation_type: &str,
    other: &EntityKey,
    relationship_id: &str,
) -> Vec<u8> {
    let mut buf = adjacency_prefix(owner, direction, relation_type);
    push_component(&mut buf, &other.type_name);
    push_component(&mut buf, &other.id);
    push_component(&mut buf, relationship_id);
    buf
}

/// `t n|r`: prefix of one type registry.
pub fn type_prefix(namespace: Namespace) -> Vec<u8> {
    vec![TAG_TYPE, namespace.tag()]
}

/// `t n|r <type>`.
pub fn type_key(namespace: Namespace, type_name: &str) -> Vec<u8> {
    let mut buf = type_prefix(namespace);
    push_component(&mut buf, type_name);
    buf
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], tag: u8) -> Option<Self> {
        if bytes.first() != Some(&tag) {
            return None;
        }
        Some(Self { bytes, pos: 1 })
    }

    fn byte(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn component(&mut self) -> Option<String> {
        let mut out = Vec::new();
        loop {
            let byte = self.byte()?;
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            match self.byte()? {
                ESCAPED_NUL => out.push(ESCAPE),
                TERMINATOR => return String::from_utf8(out).ok(),
                _ => return None,
            }
        }
    }

    fn finish<T>(self, value: T) -> Option<T> {
        (self.pos == self.bytes.len()).then_some(value)
    }
}

/// Decodes `n <type> <id>`.
pub fn decode_node_key(bytes: &[u8]) -> Option<EntityKey> {
    let mut reader = Reader::new(bytes, TAG_NODE)?;
    let node_type = reader.component()?;
    let id = reader.component()?;
    reader.finish(EntityKey::new(node_type, id))
}

/// Decodes `r <type> <id>`.
pub fn decode_relationship_key(bytes: &[u8]) -> Option<EntityKey> {
    let mut reader = Reader::new(bytes, TAG_RELATIONSHIP)?;
    let relation_type = reader.component()?;
    let id = reader.component()?;
    reader.finish(EntityKey::new(relation_type, id))
}

/// Decoded adjacency key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjacencyKey {
    /// Node owning the bucket.
    pub owner: EntityKey,
    /// Bucket direction.
    pub direction: Direction,
    /// Relationship type.
    pub relation_type: String,
    /// Opposite endpoint.
    pub other: EntityKey,
    /// Relationship id.
    pub relationship_id: String,
}

/// Decodes a full adjacency key.
pub fn decode_adjacency_key(bytes: &[u8]) -> Option<AdjacencyKey> {
    let mut reader = Reader::new(bytes, TAG_ADJACENCY)?;
    let owner = EntityKey::new(reader.component()?, reader.component()?);
    let direction = match reader.byte()? {
        DIR_OUT => Direction::Outgoing,
        DIR_IN => Direction::Incoming,
        _ => return None,
    };
    let relation_type = reader.component()?;
    let other = EntityKey::new(reader.component()?, reader.component()?);
    let relationship_id = reader.component()?;
    reader.finish(AdjacencyKey {
        owner,
        direction,
        relation_type,
        other,
        relationship_id,
    })
}

/// Decodes `t n|r <type>`.
pub fn decode_type_key(bytes: &[u8]) -> Option<(Namespace, String)> {
    let mut reader = Reader::new(bytes, TAG_TYPE)?;
    let namespace = match reader.byte()? {
        TAG_NODE => Namespace::Node,
        TAG_RELATIONSHIP => Namespace::Relationship,
        _ => return None,
    };
    let type_name = reader.component()?;
    reader.finish((namespace, type_name))
}
