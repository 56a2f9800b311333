//! The dynamic property model.
//!
//! Every domain object is a [`Base`]: a handful of known fields plus an open
//! bag of named properties, so the serializer needs no per-type code. The
//! bag's value space is the closed [`Value`] sum type; anything outside it
//! is unrepresentable, which is what enforces the hasher's allow-list.
//!
//! Property kinds are declared by naming convention on the bag key:
//! a `@` prefix marks the member detachable, a `__` prefix hides it from
//! serialization and hashing entirely, anything else serializes inline.

use crate::object::{KEY_APPLICATION_ID, KEY_ID, KEY_TYPE, ObjectId};
use crate::serializer::{SerializeError, Serializer};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Prefix marking a dynamic member as detachable.
pub const DETACH_PREFIX: char = '@';
/// Prefix marking a dynamic member as hidden.
pub const HIDDEN_PREFIX: &str = "__";

/// Errors raised by property access on a [`Base`].
#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("missing member: {0}")]
    MissingMember(String),

    #[error("invalid value for member {member}: {reason}")]
    InvalidValue { member: String, reason: String },
}

/// The closed sum of property values.
///
/// `Int` and `Float` are distinct on the wire (integer vs. non-integer JSON
/// numbers); `DateTime` and `Uuid` serialize as strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Box<Base>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&Base> {
        match self {
            Value::Object(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Base> {
        match self {
            Value::Object(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Base> for Value {
    fn from(v: Base) -> Self {
        Value::Object(Box::new(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A graph node: known fields plus the open property bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Base {
    /// Content hash, assigned by a serialization pass. A mutation leaves a
    /// previously returned id stale until the next pass.
    id: Option<ObjectId>,
    /// Registered stable type tag (wire key `speckle_type`).
    type_tag: String,
    /// Optional caller-supplied correlation id (wire key `applicationId`).
    application_id: Option<String>,
    /// Dynamic members, ordered for deterministic serialization.
    props: BTreeMap<String, Value>,
}

impl Base {
    /// Create a node with the given type tag and an empty bag.
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            id: None,
            type_tag: type_tag.into(),
            application_id: None,
            props: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    pub fn set_application_id(&mut self, application_id: Option<String>) {
        self.application_id = application_id;
    }

    /// Assign the content hash. Called by the serializer and deserializer.
    pub(crate) fn assign_id(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    /// Look a member up: the bag first, then the known fields. A member that
    /// exists but holds `Value::Null` is found, not missing.
    pub fn get(&self, key: &str) -> Result<Value, PropertyError> {
        if let Some(v) = self.props.get(key) {
            return Ok(v.clone());
        }
        match key {
            KEY_ID => Ok(self
                .id
                .map_or(Value::Null, |id| Value::Text(id.to_hex()))),
            KEY_TYPE => Ok(Value::Text(self.type_tag.clone())),
            KEY_APPLICATION_ID => Ok(self
                .application_id
                .clone()
                .map_or(Value::Null, Value::Text)),
            _ => Err(PropertyError::MissingMember(key.to_string())),
        }
    }

    /// Write a member: a key naming a known field writes through to it
    /// (with shape validation), anything else goes into the bag.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), PropertyError> {
        let value = value.into();
        match key {
            KEY_ID => {
                self.id = match value {
                    Value::Null => None,
                    Value::Text(hex) => {
                        Some(ObjectId::from_hex(&hex).map_err(|e| PropertyError::InvalidValue {
                            member: key.to_string(),
                            reason: e.to_string(),
                        })?)
                    }
                    other => {
                        return Err(PropertyError::InvalidValue {
                            member: key.to_string(),
                            reason: format!("expected hex string or null, got {:?}", other),
                        });
                    }
                };
            }
            KEY_TYPE => match value {
                Value::Text(tag) => self.type_tag = tag,
                other => {
                    return Err(PropertyError::InvalidValue {
                        member: key.to_string(),
                        reason: format!("expected string, got {:?}", other),
                    });
                }
            },
            KEY_APPLICATION_ID => match value {
                Value::Null => self.application_id = None,
                Value::Text(id) => self.application_id = Some(id),
                other => {
                    return Err(PropertyError::InvalidValue {
                        member: key.to_string(),
                        reason: format!("expected string or null, got {:?}", other),
                    });
                }
            },
            _ => {
                self.props.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Borrow a bag member.
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Mutably borrow a bag member. Mutation invalidates any previously
    /// computed id of this node and its ancestors.
    pub fn prop_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.props.get_mut(key)
    }

    /// Remove a bag member.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.props.remove(key)
    }

    /// Union of known-field names and bag keys, the surface the serializer
    /// walks.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        [KEY_ID, KEY_TYPE, KEY_APPLICATION_ID]
            .into_iter()
            .chain(self.props.keys().map(String::as_str))
    }

    /// Bag keys only. The detach/hidden prefix conventions are evaluated
    /// against these.
    pub fn dynamic_members(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    /// Dynamic members in deterministic order, with values.
    pub(crate) fn dynamic_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Insert straight into the bag, bypassing known-field routing. Used by
    /// the deserializer, which strips the known fields first.
    pub(crate) fn insert_prop(&mut self, key: String, value: Value) {
        self.props.insert(key, value);
    }

    /// Self plus the number of distinct detached descendants, as a receiver
    /// of this graph would count them. Runs a serialization pass with no
    /// write targets.
    pub fn total_children_count(&self) -> Result<u64, SerializeError> {
        let serialized = Serializer::new().serialize(self)?;
        Ok(serialized.root_closure.len() as u64 + 1)
    }
}

/// Whether a dynamic member key requests detachment.
pub fn is_detached_key(key: &str) -> bool {
    key.starts_with(DETACH_PREFIX)
}

/// Whether a dynamic member key is hidden from serialization and hashing.
pub fn is_hidden_key(key: &str) -> bool {
    key.starts_with(HIDDEN_PREFIX)
}
