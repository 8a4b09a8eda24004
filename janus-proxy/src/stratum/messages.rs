//! JSON-RPC envelope for Stratum v1.
//!
//! Stratum predates JSON-RPC 2.0 and uses non-standard conventions:
//! notifications carry `id: null` instead of omitting the field, errors
//! are flat arrays `[code, message, traceback]`, and there is no version
//! field. A standard JSON-RPC library would fight these quirks, so the
//! envelope is a small custom type.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Stratum error codes used by the proxy.
///
/// Codes 20-25 follow the de-facto assignments from the original slush
/// implementation; -3 is the JSON-RPC "method not found" convention that
/// pools reuse.
pub mod error_codes {
    pub const OTHER: i64 = 20;
    pub const JOB_NOT_FOUND: i64 = 21;
    pub const DUPLICATE_SHARE: i64 = 22;
    pub const LOW_DIFFICULTY: i64 = 23;
    pub const UNAUTHORIZED_WORKER: i64 = 24;
    pub const NOT_SUBSCRIBED: i64 = 25;
    pub const METHOD_NOT_FOUND: i64 = -3;
}

/// JSON-RPC message envelope.
///
/// Responses always serialize both `result` and `error` (as `null` when
/// absent): some miners disconnect when the `error` key is missing from a
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification, from either side.
    Request {
        /// Message ID (null for notifications)
        id: Option<u64>,
        /// Method name (e.g., "mining.notify", "mining.subscribe")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request.
    Response {
        /// Message ID matching the request
        id: u64,
        /// Result value (null on failure)
        #[serde(default)]
        result: Option<Value>,
        /// Error value (null on success)
        #[serde(default)]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Create a success response.
    pub fn response_ok(id: u64, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response with a Stratum error array.
    pub fn response_err(id: u64, code: i64, message: &str) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(json!([code, message, Value::Null])),
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Request { id: None, .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Extract `(code, message)` from a Stratum error value.
///
/// Pools send `[code, "message", traceback]`; anything else degrades to
/// code 20 with a debug rendering.
pub fn parse_error_array(error: &Value) -> (i64, String) {
    if let Some(arr) = error.as_array() {
        let code = arr.first().and_then(Value::as_i64).unwrap_or(error_codes::OTHER);
        let message = arr
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        (code, message)
    } else {
        (error_codes::OTHER, format!("{error:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mining_notify() {
        let json = json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                "job1",
                "prevhash",
                "coinbase1",
                "coinbase2",
                ["merkle1", "merkle2"],
                "20000000",
                "1a00ffff",
                "504e86b9",
                true
            ]
        });

        let msg: JsonRpcMessage = serde_json::from_value(json).unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.method(), Some("mining.notify"));

        match msg {
            JsonRpcMessage::Request { params, .. } => {
                let arr = params.as_array().expect("params should be an array");
                assert_eq!(arr.len(), 9);
                assert_eq!(arr[0], "job1");
                assert_eq!(arr[8], true);
            }
            _ => panic!("expected Request variant"),
        }
    }

    #[test]
    fn parse_response() {
        let json = json!({ "id": 1, "result": true, "error": null });
        let msg: JsonRpcMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.id(), Some(1));

        match msg {
            JsonRpcMessage::Response { result, error, .. } => {
                assert_eq!(result, Some(json!(true)));
                assert_eq!(error, None);
            }
            _ => panic!("expected Response variant"),
        }
    }

    #[test]
    fn parse_response_without_error_field() {
        let msg: JsonRpcMessage = serde_json::from_str(r#"{"id":7,"result":false}"#).unwrap();
        match msg {
            JsonRpcMessage::Response { id, result, error } => {
                assert_eq!(id, 7);
                assert_eq!(result, Some(json!(false)));
                assert_eq!(error, None);
            }
            _ => panic!("expected Response variant"),
        }
    }

    #[test]
    fn notification_serializes_null_id() {
        let msg = JsonRpcMessage::notification("mining.set_difficulty", json!([512]));
        let serialized = serde_json::to_string(&msg).unwrap();
        assert!(serialized.contains("\"id\":null"));
        assert!(serialized.contains("mining.set_difficulty"));
    }

    #[test]
    fn response_serializes_both_fields() {
        let ok = JsonRpcMessage::response_ok(3, json!(true));
        let serialized = serde_json::to_string(&ok).unwrap();
        assert!(serialized.contains("\"result\":true"));
        assert!(serialized.contains("\"error\":null"));

        let err = JsonRpcMessage::response_err(4, 21, "Job not found");
        let serialized = serde_json::to_string(&err).unwrap();
        assert!(serialized.contains("\"result\":null"));
        assert!(serialized.contains(r#"[21,"Job not found",null]"#));
    }

    #[test]
    fn error_array_parsing() {
        let (code, msg) = parse_error_array(&json!([23, "Low difficulty share", null]));
        assert_eq!(code, 23);
        assert_eq!(msg, "Low difficulty share");

        let (code, _) = parse_error_array(&json!("weird"));
        assert_eq!(code, error_codes::OTHER);
    }

    #[test]
    fn request_with_missing_params_defaults() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id":2,"method":"mining.extranonce.subscribe"}"#).unwrap();
        assert_eq!(msg.method(), Some("mining.extranonce.subscribe"));
        assert_eq!(msg.id(), Some(2));
    }
}
