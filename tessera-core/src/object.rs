//! Content addressing primitives.
//!
//! Every stored object is identified by the SHA-256 hash of its canonical
//! JSON document (the document without its own `id` field). Detached
//! sub-objects are replaced in their parent by a reference token, and each
//! stored document carries a closure table of its detached descendants.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Wire key of the content hash on a stored document.
pub const KEY_ID: &str = "id";
/// Wire key of the type tag.
pub const KEY_TYPE: &str = "speckle_type";
/// Wire key of the caller-supplied correlation id.
pub const KEY_APPLICATION_ID: &str = "applicationId";
/// Wire key of the closure table.
pub const KEY_CLOSURE: &str = "__closure";
/// Type tag of a reference token spliced in place of a detached child.
pub const REFERENCE_TYPE: &str = "reference";
/// Wire key of the referenced hash inside a reference token.
pub const KEY_REFERENCED_ID: &str = "referencedId";

/// Unique identifier for any stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Hashes travel as hex strings in JSON documents and on the wire, not as
// byte arrays.
impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = ObjectId;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a 64-character hex string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ObjectId, E> {
                ObjectId::from_hex(v).map_err(|e| E::custom(format!("invalid object id: {}", e)))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// Closure table of a stored document: detached descendant hash mapped to
/// the minimum number of detach boundaries crossed to first reach it.
///
/// The receive side reads the root's closure to know, before fetching
/// anything else, how many objects the full graph contains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure(BTreeMap<ObjectId, u32>);

impl Closure {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Record a descendant at the given depth, keeping the minimum when the
    /// id was already reached on a shorter path.
    pub fn insert_min(&mut self, id: ObjectId, depth: u32) {
        self.0
            .entry(id)
            .and_modify(|d| *d = (*d).min(depth))
            .or_insert(depth);
    }

    /// Fold a directly detached child into this closure: the child itself at
    /// depth 1, its own descendants shifted one boundary deeper.
    pub fn absorb_detached(&mut self, child_id: ObjectId, child: &Closure) {
        self.insert_min(child_id, 1);
        for (id, depth) in &child.0 {
            self.insert_min(*id, depth + 1);
        }
    }

    /// Fold an inline child's closure into this one. No boundary was
    /// crossed, so depths carry over unchanged.
    pub fn absorb_inline(&mut self, child: &Closure) {
        for (id, depth) in &child.0 {
            self.insert_min(*id, *depth);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.0.contains_key(id)
    }

    pub fn depth(&self, id: &ObjectId) -> Option<u32> {
        self.0.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &u32)> {
        self.0.iter()
    }

    /// Render as the `__closure` JSON member (hex key, sorted).
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (id, depth) in &self.0 {
            map.insert(id.to_hex(), serde_json::Value::from(*depth));
        }
        serde_json::Value::Object(map)
    }

    /// Parse a `__closure` JSON member. Non-object input or malformed keys
    /// are rejected; depth values that are not unsigned integers default to 1.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, hex::FromHexError> {
        let mut closure = Closure::new();
        if let Some(map) = value.as_object() {
            for (key, depth) in map {
                let id = ObjectId::from_hex(key)?;
                let depth = depth.as_u64().unwrap_or(1) as u32;
                closure.insert_min(id, depth);
            }
        }
        Ok(closure)
    }
}
