//! Error carriers recognised across the core.

use thiserror::Error;

use crate::rpc::{error_codes, RpcError};

/// The error kinds every nanobot crate speaks.
///
/// `ToolError` is deliberately absent: a tool failure is a successful
/// `tools/call` whose result has `isError=true`, and it propagates to the
/// model as data rather than through this type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A JSON-RPC error, either produced locally or echoed from a peer.
    #[error("{0}")]
    Rpc(RpcError),

    /// The peer demands OAuth; carries the protected-resource metadata URL
    /// from the `WWW-Authenticate` challenge.
    #[error("authorization required by {protected_resource}")]
    AuthRequired { protected_resource: String },

    /// The peer no longer knows the session id we presented.
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    /// A hook in the interception pipeline refused the message.
    #[error("hook {hook} rejected message: {reason}")]
    HookRejected { hook: String, reason: String },

    /// HTTP or stream-level failure talking to a peer.
    #[error("transport: {0}")]
    Transport(String),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Invalid-params error for the given method.
    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        CoreError::Rpc(RpcError::new(error_codes::INVALID_PARAMS, detail.to_string()))
    }

    /// Method-not-found error.
    pub fn method_not_found(method: &str) -> Self {
        CoreError::Rpc(RpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("method {} not found", method),
        ))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        CoreError::Rpc(RpcError::new(error_codes::INTERNAL_ERROR, detail.to_string()))
    }

    /// Render as the JSON-RPC error object a response carries.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            CoreError::Rpc(e) => e.clone(),
            CoreError::AuthRequired { protected_resource } => RpcError::with_data(
                error_codes::AUTH_REQUIRED,
                "authorization required",
                serde_json::json!({"protectedResource": protected_resource}),
            ),
            CoreError::SessionNotFound { session_id } => RpcError::with_data(
                error_codes::SESSION_NOT_FOUND,
                "session not found",
                serde_json::json!({"sessionId": session_id}),
            ),
            CoreError::HookRejected { hook, reason } => RpcError::with_data(
                error_codes::REJECTED_BY_HOOK,
                format!("rejected by hook {}", hook),
                serde_json::json!({"hook": hook, "reason": reason}),
            ),
            CoreError::Transport(detail) => {
                RpcError::new(error_codes::INTERNAL_ERROR, detail.clone())
            }
            CoreError::Cancelled => RpcError::new(error_codes::INTERNAL_ERROR, "cancelled"),
            CoreError::Json(e) => RpcError::new(error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Recover the typed carrier from an error object received on the wire.
    pub fn from_rpc_error(err: RpcError) -> Self {
        match err.code {
            error_codes::AUTH_REQUIRED => {
                let resource = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("protectedResource"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                CoreError::AuthRequired {
                    protected_resource: resource,
                }
            }
            error_codes::SESSION_NOT_FOUND => {
                let id = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                CoreError::SessionNotFound { session_id: id }
            }
            error_codes::REJECTED_BY_HOOK => {
                let hook = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("hook"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let reason = err
                    .data
                    .as_ref()
                    .and_then(|d| d.get("reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                CoreError::HookRejected { hook, reason }
            }
            _ => CoreError::Rpc(err),
        }
    }
}
