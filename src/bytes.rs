//! Binary payload codec.
//!
//! Raw byte values travel through filters, updates, and stored documents as
//! `{"$binary": "<base64>"}` wrapper objects. Both the SQL path and the
//! evaluator compare the same compact encoding, so equality stays byte-exact.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};

pub const BINARY_KEY: &str = "$binary";

/// Wrap raw bytes into a binary value.
pub fn encode(bytes: &[u8]) -> Value {
    let mut map = Map::new();
    map.insert(BINARY_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(map)
}

/// Unwrap a binary value back into raw bytes.
pub fn decode(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let encoded = obj.get(BINARY_KEY)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

/// Whether this value is a binary wrapper object.
pub fn is_binary(value: &Value) -> bool {
    matches!(value.as_object(),
        Some(obj) if obj.len() == 1 && obj.get(BINARY_KEY).map_or(false, Value::is_string))
}

/// Whether any value in the tree is a binary wrapper.
pub fn contains_binary(value: &Value) -> bool {
    match value {
        Value::Object(map) => is_binary(value) || map.values().any(contains_binary),
        Value::Array(items) => items.iter().any(contains_binary),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let payload = b"\x00\x01binary\xff";
        let value = encode(payload);
        assert!(is_binary(&value));
        assert_eq!(decode(&value).unwrap(), payload);
    }

    #[test]
    fn test_detection() {
        assert!(!is_binary(&json!({"$binary": 1})));
        assert!(!is_binary(&json!({"$binary": "aGk=", "extra": true})));
        assert!(contains_binary(&json!({"nested": {"blob": {"$binary": "aGk="}}})));
        assert!(contains_binary(&json!([1, {"$binary": "aGk="}])));
        assert!(!contains_binary(&json!({"plain": [1, 2, 3]})));
    }
}
