//! Request and response packets exchanged on ack and response channels.
//!
//! Requests arrive as `{ "id": string, "data": any }`. Responses are the
//! handler's payload with `id` stamped onto it; error responses carry
//! `status: "error"` and an `err` message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message published when a request names an operation with no handler.
pub const NO_PATTERN_MESSAGE: &str =
    "There is no equivalent message pattern defined in the remote service.";

/// Key under which non-object payloads are wrapped before the id is stamped.
pub const WRAPPED_RESPONSE_KEY: &str = "response";

/// Inbound request decoded from an ack channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Caller-supplied identifier correlating the response to the call.
    pub id: String,

    /// Argument passed to the handler. Absent data decodes as `null`.
    #[serde(default)]
    pub data: Value,
}

/// Discriminator carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Error,
}

/// In-band error reply for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: String,
    pub status: ResponseStatus,
    pub err: String,
}

impl ErrorResponse {
    /// Builds an error response for `id`.
    #[must_use]
    pub fn new(id: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            err: err.into(),
        }
    }

    /// The reply sent when no handler is registered for the operation.
    #[must_use]
    pub fn no_pattern(id: impl Into<String>) -> Self {
        Self::new(id, NO_PATTERN_MESSAGE)
    }

    /// Converts into a JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        let mut map = Map::with_capacity(3);
        map.insert("id".to_string(), Value::String(self.id));
        map.insert("status".to_string(), Value::String("error".to_string()));
        map.insert("err".to_string(), Value::String(self.err));
        Value::Object(map)
    }
}

/// Stamps `id` onto a response payload, overwriting any existing `id`.
///
/// Objects keep all their fields. Any other value is wrapped as
/// `{ "response": payload }` first, so the result is always an object.
#[must_use]
pub fn stamp_id(payload: Value, id: &str) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::with_capacity(2);
            map.insert(WRAPPED_RESPONSE_KEY.to_string(), other);
            map
        }
    };
    map.insert("id".to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_decodes_id_and_data() {
        let req: RequestPacket =
            serde_json::from_value(json!({ "id": "42", "data": { "name": "ada" } })).unwrap();
        assert_eq!(req.id, "42");
        assert_eq!(req.data, json!({ "name": "ada" }));
    }

    #[test]
    fn request_without_data_decodes_null() {
        let req: RequestPacket = serde_json::from_value(json!({ "id": "7" })).unwrap();
        assert_eq!(req.data, Value::Null);
    }

    #[test]
    fn request_without_id_is_rejected() {
        let res = serde_json::from_value::<RequestPacket>(json!({ "data": 1 }));
        assert!(res.is_err());
    }

    #[test]
    fn request_with_numeric_id_is_rejected() {
        let res = serde_json::from_value::<RequestPacket>(json!({ "id": 1, "data": 1 }));
        assert!(res.is_err());
    }

    #[test]
    fn error_response_wire_shape() {
        let value = ErrorResponse::new("9", "boom").into_value();
        assert_eq!(value, json!({ "id": "9", "status": "error", "err": "boom" }));
    }

    #[test]
    fn error_response_serde_matches_into_value() {
        let resp = ErrorResponse::no_pattern("1");
        assert_eq!(serde_json::to_value(&resp).unwrap(), resp.into_value());
    }

    #[test]
    fn no_pattern_response_uses_constant() {
        let resp = ErrorResponse::no_pattern("abc");
        assert_eq!(resp.err, NO_PATTERN_MESSAGE);
        assert_eq!(resp.status, ResponseStatus::Error);
    }

    #[test]
    fn stamp_id_merges_into_object() {
        let value = stamp_id(json!({ "greeting": "hi" }), "42");
        assert_eq!(value, json!({ "greeting": "hi", "id": "42" }));
    }

    #[test]
    fn stamp_id_overwrites_existing_id() {
        let value = stamp_id(json!({ "id": "spoofed", "ok": true }), "42");
        assert_eq!(value, json!({ "id": "42", "ok": true }));
    }

    #[test]
    fn stamp_id_wraps_scalars() {
        assert_eq!(stamp_id(json!(3), "1"), json!({ "response": 3, "id": "1" }));
        assert_eq!(
            stamp_id(Value::Null, "1"),
            json!({ "response": null, "id": "1" })
        );
        assert_eq!(
            stamp_id(json!([1, 2]), "1"),
            json!({ "response": [1, 2], "id": "1" })
        );
    }
}
