//! The content hasher / serializer.
//!
//! A synchronous depth-first walk over a [`Base`] graph that resolves the
//! detach/hide conventions, produces one canonical JSON document per
//! detached node, and assigns every node the SHA-256 hash of its document.
//! Documents come out in dependency order (children before parents, root
//! last) so a write sink can store them as produced.
//!
//! Canonical form: compact JSON, keys in a fixed order: `speckle_type`,
//! `applicationId` (when set), dynamic members sorted by key, `__closure`
//! last. The hash is computed over that document; the stored document is the
//! same with `id` prepended.

use crate::base::{Base, Value, is_detached_key, is_hidden_key};
use crate::object::{
    Closure, KEY_APPLICATION_ID, KEY_CLOSURE, KEY_ID, KEY_REFERENCED_ID, KEY_TYPE, ObjectId,
    REFERENCE_TYPE,
};
use crate::registry::TypeRegistry;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised during serialization. All of them abort the whole
/// operation; a partially hashed graph cannot be trusted.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("non-finite number in member {0}")]
    NonFiniteNumber(String),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization cancelled")]
    Cancelled,
}

/// The output of one serialization pass.
#[derive(Debug, Clone)]
pub struct Serialized {
    /// Hash of the root document.
    pub root_id: ObjectId,
    /// The root's stored document.
    pub root_json: String,
    /// The root's closure: every detached descendant and its minimum depth.
    pub root_closure: Closure,
    /// All stored documents in dependency order, root last. Each id appears
    /// at most once per pass.
    pub objects: Vec<(ObjectId, String)>,
}

/// One node's document before the `id` is spliced in.
struct SerializedNode {
    id: ObjectId,
    doc: JsonMap<String, JsonValue>,
    closure: Closure,
}

/// Graph walker. One instance serves one pass.
pub struct Serializer<'a> {
    registry: Option<&'a TypeRegistry>,
    cancellation: CancellationToken,
    emitted: HashSet<ObjectId>,
    objects: Vec<(ObjectId, String)>,
}

impl Default for Serializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Serializer<'a> {
    pub fn new() -> Self {
        Self {
            registry: None,
            cancellation: CancellationToken::new(),
            emitted: HashSet::new(),
            objects: Vec::new(),
        }
    }

    /// Consult the given registry for typed detachment in addition to the
    /// `@` key convention.
    pub fn with_registry(mut self, registry: &'a TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Serialize a graph. The root is always stored, even when it has no
    /// detached members.
    pub fn serialize(mut self, root: &Base) -> Result<Serialized, SerializeError> {
        let node = self.serialize_base(root)?;
        let stored = stored_json(&node)?;
        if self.emitted.insert(node.id) {
            self.objects.push((node.id, stored.clone()));
        }
        tracing::debug!(
            root = %node.id,
            objects = self.objects.len(),
            "serialization pass complete"
        );
        Ok(Serialized {
            root_id: node.id,
            root_json: stored,
            root_closure: node.closure,
            objects: self.objects,
        })
    }

    fn serialize_base(&mut self, base: &Base) -> Result<SerializedNode, SerializeError> {
        if self.cancellation.is_cancelled() {
            return Err(SerializeError::Cancelled);
        }

        let mut doc = JsonMap::new();
        doc.insert(
            KEY_TYPE.to_string(),
            JsonValue::String(base.type_tag().to_string()),
        );
        if let Some(app_id) = base.application_id() {
            doc.insert(
                KEY_APPLICATION_ID.to_string(),
                JsonValue::String(app_id.to_string()),
            );
        }

        let mut closure = Closure::new();
        for (key, value) in base.dynamic_entries() {
            if is_hidden_key(key) {
                continue;
            }
            let detach = is_detached_key(key)
                || self
                    .registry
                    .is_some_and(|r| r.is_detached(base.type_tag(), key));
            let encoded = self.serialize_value(key, value, detach, &mut closure)?;
            doc.insert(key.to_string(), encoded);
        }

        if !closure.is_empty() {
            doc.insert(KEY_CLOSURE.to_string(), closure.to_json());
        }

        let canonical = serde_json::to_string(&doc)?;
        let id = ObjectId::from_data(canonical.as_bytes());
        Ok(SerializedNode { id, doc, closure })
    }

    fn serialize_value(
        &mut self,
        member: &str,
        value: &Value,
        detach: bool,
        closure: &mut Closure,
    ) -> Result<JsonValue, SerializeError> {
        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Int(i) => Ok(JsonValue::from(*i)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| SerializeError::NonFiniteNumber(member.to_string())),
            Value::Text(s) => Ok(JsonValue::String(s.clone())),
            Value::DateTime(dt) => Ok(JsonValue::String(dt.to_rfc3339())),
            Value::Uuid(u) => Ok(JsonValue::String(u.to_string())),
            Value::List(items) => {
                // The detach decision applies per element.
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.serialize_value(member, item, detach, closure)?);
                }
                Ok(JsonValue::Array(out))
            }
            Value::Map(entries) => {
                let mut out = JsonMap::new();
                for (key, item) in entries {
                    out.insert(
                        key.clone(),
                        self.serialize_value(member, item, detach, closure)?,
                    );
                }
                Ok(JsonValue::Object(out))
            }
            Value::Object(child) => {
                let node = self.serialize_base(child)?;
                if detach {
                    if self.emitted.insert(node.id) {
                        let stored = stored_json(&node)?;
                        self.objects.push((node.id, stored));
                    }
                    closure.absorb_detached(node.id, &node.closure);
                    Ok(reference_token(node.id))
                } else {
                    closure.absorb_inline(&node.closure);
                    Ok(JsonValue::Object(doc_with_id(&node)))
                }
            }
        }
    }
}

/// A reference token spliced in place of a detached child.
fn reference_token(id: ObjectId) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert(
        KEY_TYPE.to_string(),
        JsonValue::String(REFERENCE_TYPE.to_string()),
    );
    map.insert(
        KEY_REFERENCED_ID.to_string(),
        JsonValue::String(id.to_hex()),
    );
    JsonValue::Object(map)
}

/// A node's document with its `id` prepended.
fn doc_with_id(node: &SerializedNode) -> JsonMap<String, JsonValue> {
    let mut map = JsonMap::new();
    map.insert(KEY_ID.to_string(), JsonValue::String(node.id.to_hex()));
    for (key, value) in &node.doc {
        map.insert(key.clone(), value.clone());
    }
    map
}

/// The stored (wire) form of a node.
fn stored_json(node: &SerializedNode) -> Result<String, SerializeError> {
    Ok(serde_json::to_string(&doc_with_id(node))?)
}

/// Recompute the content hash of a stored document: strip `id`, re-serialize
/// compact, hash. Used by stores that verify payloads before accepting them.
pub fn verify_stored_document(json: &str) -> Result<ObjectId, SerializeError> {
    let value: JsonValue = serde_json::from_str(json)?;
    let mut without_id = JsonMap::new();
    if let Some(map) = value.as_object() {
        for (key, val) in map {
            if key != KEY_ID {
                without_id.insert(key.clone(), val.clone());
            }
        }
    }
    let canonical = serde_json::to_string(&without_id)?;
    Ok(ObjectId::from_data(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeSpec;

    fn point(x: i64) -> Base {
        let mut base = Base::new("Point");
        base.set("x", x).unwrap();
        base
    }

    #[test]
    fn test_determinism_for_equal_graphs() {
        let mut a = Base::new("Model");
        a.set("name", "roof").unwrap();
        a.set("@child", point(1)).unwrap();

        let mut b = Base::new("Model");
        b.set("@child", point(1)).unwrap();
        b.set("name", "roof").unwrap();

        let sa = Serializer::new().serialize(&a).unwrap();
        let sb = Serializer::new().serialize(&b).unwrap();
        assert_eq!(sa.root_id, sb.root_id);
        assert_eq!(sa.root_json, sb.root_json);
    }

    #[test]
    fn test_different_values_hash_differently() {
        let sa = Serializer::new().serialize(&point(1)).unwrap();
        let sb = Serializer::new().serialize(&point(2)).unwrap();
        assert_ne!(sa.root_id, sb.root_id);
    }

    #[test]
    fn test_hidden_members_do_not_contribute() {
        let mut a = point(1);
        a.set("__cache", "stale").unwrap();
        let mut b = point(1);
        b.set("__cache", "fresh").unwrap();
        let mut c = point(1);
        c.set("visible", "x").unwrap();

        let sa = Serializer::new().serialize(&a).unwrap();
        let sb = Serializer::new().serialize(&b).unwrap();
        let sc = Serializer::new().serialize(&c).unwrap();
        assert_eq!(sa.root_id, sb.root_id);
        assert_ne!(sa.root_id, sc.root_id);
        assert!(!sa.root_json.contains("__cache"));
    }

    #[test]
    fn test_detached_child_example_scenario() {
        let mut parent = Base::new("Model");
        parent.set("@child", point(1)).unwrap();

        let serialized = Serializer::new().serialize(&parent).unwrap();
        assert_eq!(serialized.objects.len(), 2);

        let child_id = serialized.objects[0].0;
        let root: JsonValue = serde_json::from_str(&serialized.root_json).unwrap();
        assert_eq!(root["@child"]["speckle_type"], "reference");
        assert_eq!(root["@child"]["referencedId"], child_id.to_hex());
        assert_eq!(root["__closure"][child_id.to_hex()], 1);

        assert_eq!(serialized.root_closure.len(), 1);
        assert_eq!(parent.total_children_count().unwrap(), 2);
    }

    #[test]
    fn test_inline_child_is_embedded_with_id() {
        let mut parent = Base::new("Model");
        parent.set("child", point(1)).unwrap();

        let serialized = Serializer::new().serialize(&parent).unwrap();
        assert_eq!(serialized.objects.len(), 1);

        let root: JsonValue = serde_json::from_str(&serialized.root_json).unwrap();
        assert_eq!(root["child"]["speckle_type"], "Point");
        assert!(root["child"]["id"].is_string());
        assert!(root.get("__closure").is_none());
    }

    #[test]
    fn test_detached_and_inline_hash_differently() {
        let mut detached = Base::new("Model");
        detached.set("@child", point(1)).unwrap();
        let mut inline = Base::new("Model");
        inline.set("child", point(1)).unwrap();

        let sd = Serializer::new().serialize(&detached).unwrap();
        let si = Serializer::new().serialize(&inline).unwrap();
        assert_ne!(sd.root_id, si.root_id);
    }

    #[test]
    fn test_registry_detaches_typed_members() {
        let mut registry = TypeRegistry::new();
        registry.register("Model", TypeSpec::new().detach("elements"));

        let mut parent = Base::new("Model");
        parent.set("elements", point(1)).unwrap();

        let serialized = Serializer::new()
            .with_registry(&registry)
            .serialize(&parent)
            .unwrap();
        assert_eq!(serialized.objects.len(), 2);

        let root: JsonValue = serde_json::from_str(&serialized.root_json).unwrap();
        assert_eq!(root["elements"]["speckle_type"], "reference");
    }

    #[test]
    fn test_nested_detach_depths() {
        let mut grandchild = point(7);
        grandchild.set("tag", "leaf").unwrap();
        let mut child = Base::new("Level");
        child.set("@grandchild", grandchild).unwrap();
        let mut root = Base::new("Model");
        root.set("@child", child).unwrap();

        let serialized = Serializer::new().serialize(&root).unwrap();
        assert_eq!(serialized.objects.len(), 3);
        assert_eq!(serialized.root_closure.len(), 2);

        let depths: Vec<u32> = serialized.root_closure.iter().map(|(_, d)| *d).collect();
        assert!(depths.contains(&1));
        assert!(depths.contains(&2));
    }

    #[test]
    fn test_list_of_detached_children() {
        let mut parent = Base::new("Model");
        parent
            .set("@items", vec![Value::from(point(1)), Value::from(point(2))])
            .unwrap();

        let serialized = Serializer::new().serialize(&parent).unwrap();
        assert_eq!(serialized.objects.len(), 3);

        let root: JsonValue = serde_json::from_str(&serialized.root_json).unwrap();
        let items = root["@items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        for item in items {
            assert_eq!(item["speckle_type"], "reference");
        }
    }

    #[test]
    fn test_identical_children_emit_once() {
        let mut parent = Base::new("Model");
        parent.set("@a", point(1)).unwrap();
        parent.set("@b", point(1)).unwrap();

        let serialized = Serializer::new().serialize(&parent).unwrap();
        // same content, same hash, stored once
        assert_eq!(serialized.objects.len(), 2);
        assert_eq!(serialized.root_closure.len(), 1);
    }

    #[test]
    fn test_non_finite_float_is_an_error() {
        let mut base = Base::new("Point");
        base.set("x", f64::NAN).unwrap();
        match Serializer::new().serialize(&base) {
            Err(SerializeError::NonFiniteNumber(member)) => assert_eq!(member, "x"),
            other => panic!("expected NonFiniteNumber, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let token = CancellationToken::new();
        token.cancel();
        let result = Serializer::new()
            .with_cancellation(token)
            .serialize(&point(1));
        assert!(matches!(result, Err(SerializeError::Cancelled)));
    }

    #[test]
    fn test_stored_document_verifies() {
        let mut parent = Base::new("Model");
        parent.set("@child", point(1)).unwrap();
        let serialized = Serializer::new().serialize(&parent).unwrap();

        for (id, json) in &serialized.objects {
            assert_eq!(verify_stored_document(json).unwrap(), *id);
        }
    }

    #[test]
    fn test_detach_isolation_on_mutation() {
        let mut parent = Base::new("Model");
        parent.set("@child", point(1)).unwrap();
        let before = Serializer::new().serialize(&parent).unwrap();

        let child = parent
            .prop_mut("@child")
            .and_then(Value::as_object_mut)
            .unwrap();
        child.set("x", 2).unwrap();

        // the id computed before the mutation is a snapshot and stays valid
        let after = Serializer::new().serialize(&parent).unwrap();
        assert_ne!(after.root_id, before.root_id);
        assert_ne!(after.objects[0].0, before.objects[0].0);
    }
}
