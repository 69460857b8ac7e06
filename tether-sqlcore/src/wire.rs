//! Binary values on the wire.
//!
//! Peers cannot carry raw bytes inside JSON, so every binary value travels as a tagged object
//! `{"type": "buffer", "data": "<base64>"}`. Older peers may still send the node-style
//! `{"type": "Buffer", "data": [1, 2, 3]}` form, which is accepted on input only.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};

pub const BUFFER_TAG: &str = "buffer";

/// Wraps raw bytes into the tagged wire representation.
pub fn buffer_value(bytes: &[u8]) -> Value {
    json!({ "type": BUFFER_TAG, "data": STANDARD.encode(bytes) })
}

/// Returns the decoded bytes when `value` is a tagged buffer, `None` otherwise.
pub fn decode_buffer(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    let tag = obj.get("type")?.as_str()?;
    let data = obj.get("data")?;

    match (tag, data) {
        (BUFFER_TAG, Value::String(encoded)) => STANDARD.decode(encoded.as_bytes()).ok(),
        ("Buffer", Value::Array(items)) => items
            .iter()
            .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_buffer_decodes_to_original_bytes() {
        let bytes = [0u8, 1, 2, 254, 255];
        let value = buffer_value(&bytes);
        assert_eq!(value["type"], "buffer");
        assert_eq!(decode_buffer(&value).as_deref(), Some(&bytes[..]));
    }

    #[test]
    fn node_style_buffer_is_accepted() {
        let value = json!({ "type": "Buffer", "data": [104, 105] });
        assert_eq!(decode_buffer(&value), Some(b"hi".to_vec()));
    }

    #[test]
    fn non_buffer_objects_are_ignored() {
        assert_eq!(decode_buffer(&json!({ "type": "buffer", "data": 12 })), None);
        assert_eq!(decode_buffer(&json!({ "type": "Buffer", "data": [300] })), None);
        assert_eq!(decode_buffer(&json!("plain")), None);
    }
}
