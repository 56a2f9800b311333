//! Plain-JSON document conversion.
//!
//! The CLI exchanges ordinary JSON files: on send, every JSON object in the
//! file becomes a graph node (its `speckle_type` member, when present,
//! supplies the type tag) so the usual `@`/`__` key conventions apply to the
//! file's keys as written. On receive, the graph renders back to one JSON
//! document with every child inlined.

use anyhow::{Result, anyhow};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tessera_core::{Base, Value};

/// Convert a JSON document into a graph. The top level must be an object.
pub fn json_to_base(value: &JsonValue) -> Result<Base> {
    match value {
        JsonValue::Object(map) => object_to_base(map),
        _ => Err(anyhow!("document root must be a JSON object")),
    }
}

fn object_to_base(map: &JsonMap<String, JsonValue>) -> Result<Base> {
    let tag = map
        .get("speckle_type")
        .and_then(JsonValue::as_str)
        .unwrap_or("Base");
    let mut base = Base::new(tag);

    for (key, value) in map {
        match key.as_str() {
            "speckle_type" | "id" => {}
            "applicationId" => {
                if let Some(app_id) = value.as_str() {
                    base.set_application_id(Some(app_id.to_string()));
                }
            }
            _ => {
                base.set(key, json_to_value(value)?)
                    .map_err(|e| anyhow!("member {}: {}", key, e))?;
            }
        }
    }
    Ok(base)
}

fn json_to_value(value: &JsonValue) -> Result<Value> {
    Ok(match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(
                    n.as_f64()
                        .ok_or_else(|| anyhow!("unrepresentable number {}", n))?,
                )
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Array(items) => Value::List(
            items
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<Value>>>()?,
        ),
        JsonValue::Object(map) => Value::Object(Box::new(object_to_base(map)?)),
    })
}

/// Render a graph back to one plain JSON document, children inlined.
pub fn base_to_json(base: &Base) -> Result<JsonValue> {
    let mut map = JsonMap::new();
    if let Some(id) = base.id() {
        map.insert("id".to_string(), json!(id.to_hex()));
    }
    map.insert("speckle_type".to_string(), json!(base.type_tag()));
    if let Some(app_id) = base.application_id() {
        map.insert("applicationId".to_string(), json!(app_id));
    }
    for key in base.dynamic_members() {
        let value = base
            .prop(key)
            .ok_or_else(|| anyhow!("member {} vanished mid-render", key))?;
        map.insert(key.to_string(), value_to_json(value)?);
    }
    Ok(JsonValue::Object(map))
}

fn value_to_json(value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| anyhow!("non-finite number"))?,
        Value::Text(s) => json!(s),
        Value::DateTime(dt) => json!(dt.to_rfc3339()),
        Value::Uuid(u) => json!(u.to_string()),
        Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(value_to_json)
                .collect::<Result<Vec<JsonValue>>>()?,
        ),
        Value::Map(entries) => {
            let rendered: Result<Vec<(String, JsonValue)>> = entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), value_to_json(v)?)))
                .collect();
            let mut map = JsonMap::new();
            for (k, v) in rendered? {
                map.insert(k, v);
            }
            JsonValue::Object(map)
        }
        Value::Object(child) => base_to_json(child)?,
    })
}
