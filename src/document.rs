//! Document representation and dotted-path access.
//!
//! A stored row is `(id, data)`: the surrogate `_id` lives in the `id`
//! column and is never part of the persisted JSON payload. It is stripped on
//! write and re-injected on load.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The reserved surrogate-key field.
pub const ID_FIELD: &str = "_id";

/// One stored document: surrogate id plus the ordered payload map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub data: Map<String, Value>,
}

impl Document {
    /// Deserialize a stored row, re-injecting `_id`.
    pub fn load(id: i64, raw: &str) -> Result<Self> {
        let data: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self { id, data })
    }

    /// The document as an ordered map with `_id` first.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(ID_FIELD.to_string(), Value::from(self.id));
        for (key, value) in &self.data {
            out.insert(key.clone(), value.clone());
        }
        out
    }

    /// The document as a JSON object with `_id` first.
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }
}

/// Check an incoming payload is a key/value mapping and strip any `_id`.
/// Fails before any I/O happens.
pub fn normalize_payload(doc: Value) -> Result<Map<String, Value>> {
    match doc {
        Value::Object(mut map) => {
            map.shift_remove(ID_FIELD);
            Ok(map)
        }
        other => Err(Error::MalformedDocument(format!(
            "expected an object, got {}",
            value_kind(&other)
        ))),
    }
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Look up a dotted path. Digit-only segments index into arrays. `None`
/// means the path is absent.
pub fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating (or replacing) intermediate objects as needed.
pub fn set_path(data: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut current = data;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
    }
    current.insert(last.to_string(), value);
}

/// Remove a dotted path, returning the removed value if it was present.
pub fn remove_path(data: &mut Map<String, Value>, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last()?;

    let mut current = data;
    for segment in parents {
        current = match current.get_mut(*segment)? {
            Value::Object(map) => map,
            _ => return None,
        };
    }
    current.shift_remove(*last)
}

/// Mutable access to a dotted path.
pub fn get_path_mut<'a>(data: &'a mut Map<String, Value>, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = data.get_mut(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a dotted path as a SQLite JSON path (`$.a.b` / `$.a[0]`).
pub fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for segment in path.split('.') {
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            out.push('[');
            out.push_str(segment);
            out.push(']');
        } else {
            out.push('.');
            out.push_str(segment);
        }
    }
    out
}

/// The JSON path as an escaped SQL string literal body.
pub fn path_literal(path: &str) -> String {
    json_path(path).replace('\'', "''")
}

/// `json_extract` expression for a field path.
pub fn extract_expr(path: &str) -> String {
    format!("json_extract(data, '{}')", path_literal(path))
}

/// Field paths that may appear in index definitions: dotted alphanumeric
/// segments only, since they are embedded into index and table names.
pub fn validate_field_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && !path.starts_with('.')
        && !path.ends_with('.')
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::MalformedQuery(format!("invalid field path: {path:?}")))
    }
}
