//! Key-order independent JSON serialization used as hash input.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ProvError, Result};

/// Rebuild `value` with every object's keys in lexicographic order.
/// Arrays keep their element order; scalars pass through.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact serialization of the canonical form.
pub fn canonical_json(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are always strings.
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// Canonical JSON of any serializable value.
pub fn canonical_json_of<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value)
        .map_err(|e| ProvError::Other(format!("serialize for canonical form: {e}")))?;
    Ok(canonical_json(&v))
}
