//! JSON-RPC frame codec.
//!
//! Outbound requests:
//!
//! ```text
//! {"jsonrpc":"2.0","method":<string>,"params":<value, optional>,"id":<string>,"timestamp":<ms>}
//! ```
//!
//! Inbound frames are either a success (`id` + `result`), a failure (`id` +
//! `error`), an unsolicited notification (`method`, no matching id), or one
//! of the plain-text heartbeat tokens outside the envelope format.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{CodecError, JSONRPC_VERSION, PING, PONG};

/// Plain-text heartbeat tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// `"ping"`
    Ping,
    /// `"pong"`
    Pong,
}

impl Heartbeat {
    /// Recognize a heartbeat token.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            PING => Some(Self::Ping),
            PONG => Some(Self::Pong),
            _ => None,
        }
    }

    /// Wire text of the token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => PING,
            Self::Pong => PONG,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Unsolicited server message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Notification method, e.g. `tokens.added`.
    pub method: String,
    /// Notification payload.
    pub params: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Heartbeat token.
    Heartbeat(Heartbeat),
    /// Successful response to a request.
    Response {
        /// Request id being answered.
        id: String,
        /// Result payload (may be `null`).
        result: Value,
    },
    /// Error response to a request.
    Failure {
        /// Request id being answered.
        id: String,
        /// Error object.
        error: RpcError,
    },
    /// Unsolicited event.
    Notification(Notification),
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    id: &'a str,
    timestamp: u64,
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode a request stamped with the current time.
pub fn encode_request(method: &str, params: Option<&Value>, id: &str) -> Result<String, CodecError> {
    encode_request_at(method, params, id, timestamp_ms())
}

/// Encode a request with an explicit timestamp.
pub fn encode_request_at(
    method: &str,
    params: Option<&Value>,
    id: &str,
    timestamp: u64,
) -> Result<String, CodecError> {
    let envelope = RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
        timestamp,
    };
    serde_json::to_string(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode one inbound text frame.
///
/// Malformed input is reported as an error; it never panics.
pub fn decode_frame(raw: &str) -> Result<Inbound, CodecError> {
    if let Some(heartbeat) = Heartbeat::parse(raw) {
        return Ok(Inbound::Heartbeat(heartbeat));
    }

    let value: Value = serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::InvalidEnvelope("frame is not a JSON object"));
    };

    let id = take_id(&mut obj)?;

    if let Some(error) = obj.remove("error") {
        let Some(id) = id else {
            return Err(CodecError::InvalidEnvelope("error response without id"));
        };
        let error: RpcError = serde_json::from_value(error)
            .map_err(|_| CodecError::InvalidEnvelope("malformed error object"))?;
        return Ok(Inbound::Failure { id, error });
    }

    if let Some(result) = obj.remove("result") {
        let Some(id) = id else {
            return Err(CodecError::InvalidEnvelope("response without id"));
        };
        return Ok(Inbound::Response { id, result });
    }

    match obj.remove("method") {
        Some(Value::String(method)) => Ok(Inbound::Notification(Notification {
            method,
            params: obj.remove("params"),
        })),
        Some(_) => Err(CodecError::InvalidEnvelope("method is not a string")),
        None => Err(CodecError::InvalidEnvelope("neither result, error nor method")),
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<Option<String>, CodecError> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(CodecError::InvalidEnvelope("id must be a string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request_fields() {
        let params = json!({"text": "abc"});
        let frame = encode_request_at("readers.write", Some(&params), "a1-1", 1_700_000_000_000).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "readers.write");
        assert_eq!(value["params"]["text"], "abc");
        assert_eq!(value["id"], "a1-1");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_encode_request_omits_missing_params() {
        let frame = encode_request_at("version", None, "x", 5).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(decode_frame("pong"), Ok(Inbound::Heartbeat(Heartbeat::Pong)));
        assert_eq!(decode_frame("ping\n"), Ok(Inbound::Heartbeat(Heartbeat::Ping)));
    }

    #[test]
    fn test_decode_response() {
        let raw = r#"{"jsonrpc":"2.0","id":"r-7","timestamp":1,"result":{"ok":true}}"#;
        assert_eq!(
            decode_frame(raw),
            Ok(Inbound::Response {
                id: "r-7".into(),
                result: json!({"ok": true}),
            })
        );
    }

    #[test]
    fn test_decode_null_result_is_response() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"result":null}"#;
        assert_eq!(
            decode_frame(raw),
            Ok(Inbound::Response {
                id: "3".into(),
                result: Value::Null,
            })
        );
    }

    #[test]
    fn test_decode_failure() {
        let raw = r#"{"jsonrpc":"2.0","id":"r-8","error":{"code":-32601,"message":"method not found"}}"#;
        match decode_frame(raw).unwrap() {
            Inbound::Failure { id, error } => {
                assert_eq!(id, "r-8");
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "method not found");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"media.stopped","params":{}}"#;
        assert_eq!(
            decode_frame(raw),
            Ok(Inbound::Notification(Notification {
                method: "media.stopped".into(),
                params: Some(json!({})),
            }))
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode_frame("{not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode_frame("[1,2]"), Err(CodecError::InvalidEnvelope(_))));
        assert!(matches!(
            decode_frame(r#"{"jsonrpc":"2.0"}"#),
            Err(CodecError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"result":1}"#),
            Err(CodecError::InvalidEnvelope(_))
        ));
    }
}
