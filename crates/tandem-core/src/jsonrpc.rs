//! JSON-RPC 2.0 payloads exchanged between peers.
//!
//! Payloads are serialized to JSON text and then encoded by the crypto
//! collaborator before they reach the relay.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

static LAST_PAYLOAD_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a request id unique within the process lifetime.
///
/// Ids are `unix_millis * 1000 + jitter`, bumped when needed so they are
/// strictly increasing.
pub fn payload_id() -> u64 {
    let mut jitter = [0u8; 2];
    let jitter = match getrandom::getrandom(&mut jitter) {
        Ok(()) => u64::from(u16::from_le_bytes(jitter)) % 1000,
        Err(_) => 0,
    };
    let candidate = chrono::Utc::now().timestamp_millis().max(0) as u64 * 1000 + jitter;

    let mut last = LAST_PAYLOAD_ID.load(Ordering::SeqCst);
    loop {
        let next = candidate.max(last + 1);
        match LAST_PAYLOAD_ID.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Method and params of a request, without the envelope fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestArguments {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Build a request with a fresh id.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_id(payload_id(), method, params)
    }

    pub fn with_id(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn arguments(&self) -> RequestArguments {
        RequestArguments {
            method: self.method.clone(),
            params: self.params.clone(),
        }
    }
}

/// Error member of an error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResult {
    pub id: u64,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub id: u64,
    pub jsonrpc: String,
    pub error: ErrorObject,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Result(JsonRpcResult),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        JsonRpcResponse::Result(JsonRpcResult {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        })
    }

    pub fn error(id: u64, error: ErrorObject) -> Self {
        JsonRpcResponse::Error(JsonRpcErrorResponse {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
        })
    }

    pub fn id(&self) -> u64 {
        match self {
            JsonRpcResponse::Result(r) => r.id,
            JsonRpcResponse::Error(e) => e.id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JsonRpcResponse::Error(_))
    }

    /// The error member, if this is an error response.
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match self {
            JsonRpcResponse::Error(e) => Some(&e.error),
            JsonRpcResponse::Result(_) => None,
        }
    }
}

/// Anything that can arrive on a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcPayload {
    pub fn id(&self) -> u64 {
        match self {
            JsonRpcPayload::Request(r) => r.id,
            JsonRpcPayload::Response(r) => r.id(),
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcPayload {
    fn from(r: JsonRpcRequest) -> Self {
        JsonRpcPayload::Request(r)
    }
}

impl From<JsonRpcResponse> for JsonRpcPayload {
    fn from(r: JsonRpcResponse) -> Self {
        JsonRpcPayload::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_ids_strictly_increase() {
        let a = payload_id();
        let b = payload_id();
        let c = payload_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn payload_distinguishes_requests_and_responses() {
        let req: JsonRpcPayload = serde_json::from_value(json!({
            "id": 1, "jsonrpc": "2.0", "method": "wc_sessionPing", "params": {}
        }))
        .unwrap();
        assert!(matches!(req, JsonRpcPayload::Request(_)));

        let ok: JsonRpcPayload =
            serde_json::from_value(json!({"id": 1, "jsonrpc": "2.0", "result": true})).unwrap();
        assert!(matches!(ok, JsonRpcPayload::Response(JsonRpcResponse::Result(_))));

        let err: JsonRpcPayload = serde_json::from_value(json!({
            "id": 1, "jsonrpc": "2.0", "error": {"code": 3000, "message": "nope"}
        }))
        .unwrap();
        assert!(matches!(err, JsonRpcPayload::Response(JsonRpcResponse::Error(_))));
        assert_eq!(err.id(), 1);
    }

    #[test]
    fn null_result_is_still_a_result() {
        let ok: JsonRpcResponse =
            serde_json::from_value(json!({"id": 7, "jsonrpc": "2.0", "result": null})).unwrap();
        assert!(!ok.is_error());
    }
}
