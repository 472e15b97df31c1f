//! JSON-RPC error objects.
//!
//! The gate and the install surface speak JSON-RPC to callers that never see
//! [`PluginHostError`](crate::PluginHostError) directly. Failures cross that
//! boundary as plain `{code, message, data?}` objects.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The request is not a valid JSON-RPC request object.
pub const INVALID_REQUEST: i64 = -32600;

/// Invalid method parameter(s).
pub const INVALID_PARAMS: i64 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Invalid-request error carrying the offending request.
    #[must_use]
    pub fn invalid_request(request: Value) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "The request is not a valid JSON-RPC request object.".to_string(),
            data: Some(request),
        }
    }

    /// Invalid-params error carrying the offending request.
    #[must_use]
    pub fn invalid_params(request: Value) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: "Invalid method parameter(s).".to_string(),
            data: Some(request),
        }
    }

    /// Invalid-params error with a specific message.
    #[must_use]
    pub fn invalid_params_with_message(message: impl Into<String>, request: Value) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: Some(request),
        }
    }

    /// Internal error with a specific message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Wraps any failure into a JSON-RPC internal error value.
pub fn serialize_error<E: std::fmt::Display>(err: &E) -> Value {
    json!({ "code": INTERNAL_ERROR, "message": err.to_string() })
}

/// Extracts the human-readable message from an error value, falling back to
/// the value itself.
#[must_use]
pub fn error_message(error: &Value) -> String {
    match error.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => error.to_string(),
    }
}
