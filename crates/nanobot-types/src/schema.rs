//! Tool input-schema normalisation.

use serde_json::{json, Map, Value};

/// The schema used for tools that publish none, or publish garbage.
pub fn empty_object_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

/// Coerce an absent or malformed tool schema to the empty-object schema.
///
/// Returns the coerced schema and whether coercion happened, so callers can
/// log a warning once per offending tool.
pub fn ensure_object_schema(schema: &Value) -> (Value, bool) {
    match schema {
        Value::Object(map) if map.get("type").map(|t| t == "object").unwrap_or(false) => {
            (schema.clone(), false)
        }
        Value::Object(map) if map.get("type").is_none() && map.contains_key("properties") => {
            let mut fixed = map.clone();
            fixed.insert("type".to_string(), json!("object"));
            (Value::Object(fixed), true)
        }
        _ => (empty_object_schema(), true),
    }
}

/// Fill structural gaps in an object schema: missing `type`, missing
/// `properties`, and `additionalProperties:false` when `strict` is set.
pub fn fix_schema(schema: &Value, strict: bool) -> Value {
    let mut map = match schema {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    map.entry("type".to_string()).or_insert(json!("object"));
    if !map.get("properties").map(Value::is_object).unwrap_or(false) {
        map.insert("properties".to_string(), json!({}));
    }
    if strict {
        map.insert("additionalProperties".to_string(), json!(false));
    }
    Value::Object(map)
}
