//! JSON-RPC envelope for the agent transport
//!
//! One envelope per message, in either direction. The `id`/`method` fields
//! decide the message kind: both present is a request, `method` alone is a
//! notification, `id` alone is a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code used when a registered request handler fails
pub const HANDLER_ERROR_CODE: i64 = -32000;

/// Error payload of a response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One JSON-RPC-shaped message on the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

impl Envelope {
    /// A client-initiated request
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(Value::from(id)),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// A notification (no response expected)
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// A successful response to a peer-initiated request; `id` is echoed verbatim
    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// An error response to a peer-initiated request
    pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(EnvelopeError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Peer-initiated request: carries both `method` and `id`
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    /// Response to a prior client-initiated request: `id` without `method`
    pub fn is_response(&self) -> bool {
        self.method.is_none() && self.id.is_some()
    }

    /// Notification: `method` without `id`
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}
