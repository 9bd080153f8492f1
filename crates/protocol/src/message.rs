//! JSON-RPC 2.0 message model.
//!
//! Messages keep `params`/`result` as raw [`serde_json::Value`]s: the gateway only ever needs to
//! inspect ids and method names, so tool payloads pass through untouched.

use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request id (`number | string`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number).ok_or_else(|| {
                ProtocolError::InvalidMessage(format!("id must be an integer, got {n}"))
            }),
            Value::String(s) => Ok(RequestId::String(s)),
            other => Err(ProtocolError::InvalidMessage(format!(
                "id must be a number or string, got {other}"
            ))),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(Self::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(Self::INVALID_REQUEST, format!("Invalid request: {detail}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A response. `id` is `None` only for errors about a request whose id could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Any single JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl Message {
    /// Parse one message out of an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;
        Message::try_from(raw)
    }

    pub fn to_value(&self) -> Value {
        // Serializing a `Message` only touches maps, strings and numbers.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(value: JsonRpcRequest) -> Self {
        Message::Request(value)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(value: JsonRpcNotification) -> Self {
        Message::Notification(value)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(value: JsonRpcResponse) -> Self {
        Message::Response(value)
    }
}

// ============================================================================
// Wire representation
// ============================================================================

/// Distinguishes `"id": null` (`Some(Value::Null)`) from a missing member (`None`).
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl TryFrom<RawMessage> for Message {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match raw.jsonrpc.as_deref() {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unsupported jsonrpc version {other:?}"
                )));
            }
            None => {
                return Err(ProtocolError::InvalidMessage(
                    "missing jsonrpc member".to_string(),
                ));
            }
        }

        if let Some(method) = raw.method {
            return match raw.id {
                None => Ok(Message::Notification(JsonRpcNotification {
                    method,
                    params: raw.params,
                })),
                Some(id) => Ok(Message::Request(JsonRpcRequest {
                    id: RequestId::from_value(id)?,
                    method,
                    params: raw.params,
                })),
            };
        }

        let id = match raw.id {
            None | Some(Value::Null) => None,
            Some(id) => Some(RequestId::from_value(id)?),
        };
        match (raw.result, raw.error) {
            (Some(result), None) => {
                let id = id.ok_or_else(|| {
                    ProtocolError::InvalidMessage("success response without id".to_string())
                })?;
                Ok(Message::Response(JsonRpcResponse::success(id, result)))
            }
            (None, Some(error)) => Ok(Message::Response(JsonRpcResponse::error(id, error))),
            (Some(_), Some(_)) => Err(ProtocolError::InvalidMessage(
                "response carries both result and error".to_string(),
            )),
            (None, None) => Err(ProtocolError::InvalidMessage(
                "neither a request nor a response".to_string(),
            )),
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    jsonrpc: &'static str,
    // `Some(None)` serializes as `"id": null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Option<&'a RequestId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a JsonRpcError>,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut wire = WireMessage {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Message::Request(r) => {
                wire.id = Some(Some(&r.id));
                wire.method = Some(&r.method);
                wire.params = r.params.as_ref();
            }
            Message::Notification(n) => {
                wire.method = Some(&n.method);
                wire.params = n.params.as_ref();
            }
            Message::Response(r) => {
                wire.id = Some(r.id.as_ref());
                match &r.outcome {
                    Ok(result) => wire.result = Some(result),
                    Err(error) => wire.error = Some(error),
                }
            }
        }
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<Message, ProtocolError> {
        Message::from_value(v)
    }

    #[test]
    fn classifies_requests_notifications_and_responses() {
        let req = parse(json!({"jsonrpc":"2.0","id":7,"method":"tools/list"})).unwrap();
        assert!(matches!(req, Message::Request(ref r) if r.id == RequestId::Number(7)));

        let note = parse(json!({"jsonrpc":"2.0","method":"notifications/initialized"})).unwrap();
        assert!(matches!(note, Message::Notification(_)));

        let resp = parse(json!({"jsonrpc":"2.0","id":"a","result":{"ok":true}})).unwrap();
        match resp {
            Message::Response(r) => {
                assert_eq!(r.id, Some(RequestId::String("a".into())));
                assert_eq!(r.outcome, Ok(json!({"ok": true})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn null_result_is_still_a_success() {
        let msg = parse(json!({"jsonrpc":"2.0","id":1,"result":null})).unwrap();
        assert_eq!(
            msg,
            Message::Response(JsonRpcResponse::success(RequestId::Number(1), Value::Null))
        );
    }

    #[test]
    fn error_response_may_have_null_id() {
        let msg = parse(json!({
            "jsonrpc":"2.0","id":null,
            "error":{"code":-32700,"message":"Parse error"}
        }))
        .unwrap();
        match msg {
            Message::Response(r) => {
                assert_eq!(r.id, None);
                assert_eq!(r.outcome.unwrap_err().code, JsonRpcError::PARSE_ERROR);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_version_and_shapeless_objects() {
        assert!(parse(json!({"jsonrpc":"1.0","id":1,"method":"x"})).is_err());
        assert!(parse(json!({"id":1,"method":"x"})).is_err());
        assert!(parse(json!({"jsonrpc":"2.0","id":1})).is_err());
        let both = json!({"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}});
        assert!(parse(both).is_err());
        assert!(parse(json!({"jsonrpc":"2.0","id":{"nested":1},"method":"x"})).is_err());
    }

    #[test]
    fn serializes_error_response_with_null_id() {
        let msg = Message::Response(JsonRpcResponse::error(
            None,
            JsonRpcError::parse_error("eof"),
        ));
        assert_eq!(
            msg.to_value(),
            json!({"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error: eof"}})
        );
    }

    #[test]
    fn notification_serializes_without_id() {
        let msg = Message::Notification(JsonRpcNotification::new("ping", None));
        assert_eq!(msg.to_value(), json!({"jsonrpc":"2.0","method":"ping"}));
    }
}
