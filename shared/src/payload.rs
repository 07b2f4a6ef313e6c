//! Conversions between raw HTTP bodies and the JSON values carried in
//! `REQUEST` / `RESPONSE` messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::protocol::BodyEncoding;

/// `application/json` or any `+json` structured syntax suffix.
pub fn is_json_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("application/json") || ct.contains("+json")
}

/// Bytes to put on the wire for a message body. `None` for `null`.
///
/// A string marked [`BodyEncoding::Base64`] is decoded back to raw bytes.
pub fn body_to_bytes(
    body: &Value,
    encoding: Option<BodyEncoding>,
) -> Result<Option<Vec<u8>>, base64::DecodeError> {
    match (body, encoding) {
        (Value::Null, _) => Ok(None),
        (Value::String(s), Some(BodyEncoding::Base64)) => STANDARD.decode(s).map(Some),
        (Value::String(s), None) => Ok(Some(s.clone().into_bytes())),
        (other, _) => Ok(serde_json::to_vec(other).ok()),
    }
}

/// Whether the body is structured data that was serialized as JSON.
pub fn is_structured(body: &Value) -> bool {
    !matches!(body, Value::Null | Value::String(_))
}

/// Turn a local reply body into a message body and its wire encoding.
///
/// JSON replies that parse are carried as values, UTF-8 as text, and
/// anything else as base64 so no byte is lost.
pub fn body_from_bytes(bytes: &[u8], content_type: Option<&str>) -> (Value, Option<BodyEncoding>) {
    if content_type.map(is_json_content_type).unwrap_or(false) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return (value, None);
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (Value::String(text.to_string()), None),
        Err(_) => (
            Value::String(STANDARD.encode(bytes)),
            Some(BodyEncoding::Base64),
        ),
    }
}
