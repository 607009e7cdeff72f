use bytes::Bytes;
use serde_json::Value;

/// One part of a multipart request body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    /// Form field name
    pub field: String,
    /// Client-declared file name, if any
    pub file_name: Option<String>,
    /// Raw part bytes
    pub data: Bytes,
}

/// Normalized request body, decoded before any camera semantics apply.
///
/// Exactly one variant is populated per request. Multipart wins when parts
/// are present; a body that fails lenient JSON parsing degrades to `Raw`
/// instead of rejecting the request, because malformed camera firmware must
/// not be allowed to break ingestion.
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// Parsed JSON document of any shape
    Json(Value),
    /// Multipart form parts in arrival order
    Multipart(Vec<MultipartPart>),
    /// Opaque bytes that could not be decoded further
    Raw(Bytes),
}

impl RawPayload {
    /// Decode a non-multipart request body.
    ///
    /// JSON parsing is attempted whenever the declared content type says
    /// JSON or the body looks like a JSON document, matching the lenient
    /// behavior of the camera fleet's older firmware which posts JSON with
    /// arbitrary content types.
    pub fn from_bytes(content_type: &str, body: Bytes) -> Self {
        if looks_like_json(content_type, &body) {
            if let Ok(value) = serde_json::from_slice(&body) {
                return RawPayload::Json(value);
            }
        }
        RawPayload::Raw(body)
    }

    /// The JSON document, if this payload is one
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RawPayload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// True when the payload is a JSON object (the only shape the tollgate
    /// endpoint accepts)
    pub fn is_json_object(&self) -> bool {
        matches!(self, RawPayload::Json(Value::Object(_)))
    }
}

fn looks_like_json(content_type: &str, body: &[u8]) -> bool {
    if content_type.contains("json") {
        return true;
    }
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_content_type_parses() {
        let payload = RawPayload::from_bytes("application/json", Bytes::from(r#"{"Plate":"X"}"#));
        assert!(payload.is_json_object());
    }

    #[test]
    fn test_json_body_without_content_type_parses() {
        let payload = RawPayload::from_bytes("text/plain", Bytes::from(r#"  {"a":1}"#));
        assert!(payload.as_json().is_some());
    }

    #[test]
    fn test_malformed_json_degrades_to_raw() {
        let body = Bytes::from("{not json at all");
        let payload = RawPayload::from_bytes("application/json", body.clone());
        match payload {
            RawPayload::Raw(raw) => assert_eq!(raw, body),
            other => panic!("expected Raw, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_body_is_raw() {
        let payload = RawPayload::from_bytes("application/octet-stream", Bytes::from_static(b"\xff\xd8\xff\xe0"));
        assert!(matches!(payload, RawPayload::Raw(_)));
        assert!(!payload.is_json_object());
    }

    #[test]
    fn test_json_array_is_not_object() {
        let payload = RawPayload::from_bytes("application/json", Bytes::from("[1,2,3]"));
        assert!(payload.as_json().is_some());
        assert!(!payload.is_json_object());
    }
}
