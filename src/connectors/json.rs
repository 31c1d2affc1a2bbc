use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::BoxError;
use crate::stages::Decoder;

/// A decoded JSON object.
pub type Record = Map<String, Value>;

/// Decodes a payload holding a single JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    type Payload = Bytes;
    type Record = Record;

    fn decode(&self, payload: Bytes) -> Result<Record, BoxError> {
        match serde_json::from_slice::<Value>(&payload)? {
            Value::Object(record) => Ok(record),
            other => Err(format!("expected a JSON object, got {}", type_name(&other)).into()),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object() {
        let record = JsonDecoder
            .decode(Bytes::from_static(br#"{"id": 3, "title": "write tests"}"#))
            .unwrap();
        assert_eq!(record["id"], 3);
        assert_eq!(record["title"], "write tests");
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        let err = JsonDecoder
            .decode(Bytes::from_static(b"[1, 2]"))
            .unwrap_err();
        assert_eq!(err.to_string(), "expected a JSON object, got an array");
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(JsonDecoder.decode(Bytes::from_static(b"{oops")).is_err());
    }
}
