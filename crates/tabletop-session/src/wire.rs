#![forbid(unsafe_code)]

//! Wire encoding of session messages.
//!
//! Both directions carry UTF-8 JSON:
//!
//! - host → peer: the full serialized game document (a JSON object);
//! - peer → host: one [`ActionRequest`], `{ "type": name, "data": payload }`.

use serde_json::Value;
use thiserror::Error;

use tabletop_state::ActionRequest;

/// Payloads that could not be decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON that is not a game document.
    #[error("payload is not a state document (found {0})")]
    NotADocument(&'static str),
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Encode a full state document.
#[must_use]
pub fn encode_state(doc: &Value) -> Vec<u8> {
    doc.to_string().into_bytes()
}

/// Decode a full state document; anything but a JSON object is rejected.
pub fn decode_state(bytes: &[u8]) -> Result<Value, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CodecError::NotADocument(kind_of(&value)))
    }
}

pub fn encode_action(request: &ActionRequest) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_action(bytes: &[u8]) -> Result<ActionRequest, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_wire_shape_uses_type_and_data() {
        let request = ActionRequest::new("moveEntity", json!({"id": "e1"}));
        let bytes = encode_action(&request).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw, json!({"type": "moveEntity", "data": {"id": "e1"}}));
        assert_eq!(decode_action(&bytes).unwrap(), request);
    }

    #[test]
    fn action_without_data_decodes_with_null_payload() {
        let request = decode_action(br#"{"type":"undo"}"#).unwrap();
        assert_eq!(request.kind, "undo");
        assert_eq!(request.data, Value::Null);
    }

    #[test]
    fn state_must_be_an_object() {
        assert!(decode_state(br#"{"id":"game"}"#).is_ok());
        assert!(matches!(
            decode_state(b"[1,2]"),
            Err(CodecError::NotADocument("an array"))
        ));
        assert!(matches!(decode_state(b"{\"id\":"), Err(CodecError::Json(_))));
    }
}
