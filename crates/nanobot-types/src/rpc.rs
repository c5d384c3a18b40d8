//! JSON-RPC 2.0 envelope shared by both ATP roles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP header carrying the ATP session identity.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC request/response identifier. The wire accepts both forms; ids
/// allocated locally are numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{}", n),
            RequestId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Num(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Str(s.to_string())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

/// Standard and implementation-reserved JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The peer requires OAuth authorization before this call can proceed.
    pub const AUTH_REQUIRED: i64 = -32001;
    /// The session id on the request is unknown to the receiver.
    pub const SESSION_NOT_FOUND: i64 = -32002;
    /// A hook in the interception pipeline rejected the message.
    pub const REJECTED_BY_HOOK: i64 = -32003;
}

/// One JSON-RPC 2.0 message: request, notification, or response.
///
/// A request carries `method` (+ optional `params`) and an `id`; a
/// notification is the same without an `id`; a response echoes the request
/// `id` with exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

impl Message {
    /// Build a request with an explicit id.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id.into()),
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id, never answered).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a success response echoing `id`.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing `id` (or none, for pre-dispatch
    /// failures where the id could not be read).
    pub fn error_response(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Method name, or "" for responses. Convenient for hook tag matching.
    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    /// Deserialize `params` into a typed value.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::CoreError> {
        let value = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            crate::CoreError::Rpc(RpcError::new(
                error_codes::INVALID_PARAMS,
                format!("invalid params for {}: {}", self.method_name(), e),
            ))
        })
    }

    /// The `progressToken` inside `params._meta`, if the caller set one.
    pub fn progress_token(&self) -> Option<Value> {
        self.params
            .as_ref()?
            .get("_meta")?
            .get("progressToken")
            .cloned()
    }
}

/// Parse a raw JSON body into a [`Message`], validating the envelope.
///
/// Returns the error-shaped response the server must send back when the body
/// is unparseable or violates JSON-RPC 2.0.
pub fn parse_message(raw: &[u8]) -> Result<Message, Message> {
    let msg: Message = match serde_json::from_slice(raw) {
        Ok(m) => m,
        Err(e) => {
            return Err(Message::error_response(
                None,
                RpcError::new(error_codes::PARSE_ERROR, format!("invalid JSON: {}", e)),
            ));
        }
    };
    if msg.jsonrpc != "2.0" {
        return Err(Message::error_response(
            msg.id.clone(),
            RpcError::new(
                error_codes::INVALID_REQUEST,
                format!("unsupported jsonrpc version {:?}", msg.jsonrpc),
            ),
        ));
    }
    if msg.method.is_none() && msg.result.is_none() && msg.error.is_none() {
        return Err(Message::error_response(
            msg.id.clone(),
            RpcError::new(error_codes::INVALID_REQUEST, "message has no role"),
        ));
    }
    Ok(msg)
}
