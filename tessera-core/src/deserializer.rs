//! The deserializer.
//!
//! Rebuilds a [`Base`] graph from a stored document, resolving reference
//! tokens through a transport (typically the local cache a receive has just
//! populated). References are memoized per pass so a child reachable from
//! several places is fetched and parsed once.
//!
//! Wire keys `id`, `speckle_type` and `applicationId` go back into the known
//! fields; `__closure` is derived data and is dropped, the next
//! serialization pass recomputes it. Date-time and UUID values come back as
//! text: the wire does not distinguish them from strings, and the
//! re-serialized document (and therefore the hash) is identical either way.

use crate::base::{Base, Value};
use crate::object::{
    KEY_APPLICATION_ID, KEY_CLOSURE, KEY_ID, KEY_REFERENCED_ID, KEY_TYPE, ObjectId,
    REFERENCE_TYPE,
};
use crate::transport::{Transport, TransportError};
use futures::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("referenced object not available: {0}")]
    MissingReference(ObjectId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("deserialization cancelled")]
    Cancelled,
}

/// Graph rebuilder. One instance serves one pass.
pub struct Deserializer<'a> {
    transport: Option<&'a dyn Transport>,
    cancellation: CancellationToken,
    cache: HashMap<ObjectId, Base>,
}

impl Default for Deserializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Deserializer<'a> {
    pub fn new() -> Self {
        Self {
            transport: None,
            cancellation: CancellationToken::new(),
            cache: HashMap::new(),
        }
    }

    /// Resolve references through the given transport. Without one, any
    /// reference token is a [`DeserializeError::MissingReference`].
    pub fn with_transport(mut self, transport: &'a dyn Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Rebuild a graph from its root document.
    pub async fn deserialize(&mut self, json: &str) -> Result<Base, DeserializeError> {
        let value: JsonValue = serde_json::from_str(json)?;
        match value {
            JsonValue::Object(map) => self.base_from_map(map).await,
            _ => Err(DeserializeError::InvalidDocument(
                "top-level value is not an object".to_string(),
            )),
        }
    }

    fn base_from_map(
        &mut self,
        mut map: JsonMap<String, JsonValue>,
    ) -> BoxFuture<'_, Result<Base, DeserializeError>> {
        Box::pin(async move {
            if self.cancellation.is_cancelled() {
                return Err(DeserializeError::Cancelled);
            }

            if map.get(KEY_TYPE).and_then(JsonValue::as_str) == Some(REFERENCE_TYPE) {
                let hex = map
                    .get(KEY_REFERENCED_ID)
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        DeserializeError::InvalidDocument(
                            "reference token without referencedId".to_string(),
                        )
                    })?;
                let id = ObjectId::from_hex(hex).map_err(|e| {
                    DeserializeError::InvalidDocument(format!("bad referencedId {}: {}", hex, e))
                })?;
                return self.resolve_reference(id).await;
            }

            let type_tag = match map.remove(KEY_TYPE) {
                Some(JsonValue::String(tag)) => tag,
                _ => {
                    return Err(DeserializeError::InvalidDocument(
                        "document without speckle_type".to_string(),
                    ));
                }
            };
            let mut base = Base::new(type_tag);

            if let Some(JsonValue::String(hex)) = map.remove(KEY_ID) {
                let id = ObjectId::from_hex(&hex).map_err(|e| {
                    DeserializeError::InvalidDocument(format!("bad id {}: {}", hex, e))
                })?;
                base.assign_id(id);
            }
            if let Some(JsonValue::String(app_id)) = map.remove(KEY_APPLICATION_ID) {
                base.set_application_id(Some(app_id));
            }
            map.remove(KEY_CLOSURE);

            for (key, value) in map {
                let decoded = self.value_from_json(value).await?;
                base.insert_prop(key, decoded);
            }
            Ok(base)
        })
    }

    fn value_from_json(
        &mut self,
        value: JsonValue,
    ) -> BoxFuture<'_, Result<Value, DeserializeError>> {
        Box::pin(async move {
            Ok(match value {
                JsonValue::Null => Value::Null,
                JsonValue::Bool(b) => Value::Bool(b),
                JsonValue::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Value::Int(i)
                    } else {
                        Value::Float(n.as_f64().ok_or_else(|| {
                            DeserializeError::InvalidDocument(format!(
                                "unrepresentable number {}",
                                n
                            ))
                        })?)
                    }
                }
                JsonValue::String(s) => Value::Text(s),
                JsonValue::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.value_from_json(item).await?);
                    }
                    Value::List(out)
                }
                JsonValue::Object(map) => {
                    if map.contains_key(KEY_TYPE) {
                        Value::Object(Box::new(self.base_from_map(map).await?))
                    } else {
                        let mut out = BTreeMap::new();
                        for (key, item) in map {
                            out.insert(key, self.value_from_json(item).await?);
                        }
                        Value::Map(out)
                    }
                }
            })
        })
    }

    async fn resolve_reference(&mut self, id: ObjectId) -> Result<Base, DeserializeError> {
        if let Some(cached) = self.cache.get(&id) {
            return Ok(cached.clone());
        }
        let transport = self
            .transport
            .ok_or(DeserializeError::MissingReference(id))?;
        let json = transport
            .get_object(id)
            .await?
            .ok_or(DeserializeError::MissingReference(id))?;
        let value: JsonValue = serde_json::from_str(&json)?;
        let base = match value {
            JsonValue::Object(map) => self.base_from_map(map).await?,
            _ => {
                return Err(DeserializeError::InvalidDocument(format!(
                    "stored object {} is not a JSON object",
                    id
                )));
            }
        };
        self.cache.insert(id, base.clone());
        Ok(base)
    }
}
