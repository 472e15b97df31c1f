//! Wire types for multiplexed frames and the worker command protocol.
//!
//! The command subchannel carries framed request/response pairs: requests
//! are `{id, command, data}`, responses are `{id, result}` or `{id, error}`.
//! The id space is per-worker and never reused within a worker's lifetime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One multiplexed frame: a payload addressed to a named subchannel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Subchannel name, known to both ends ahead of time.
    pub channel: String,
    /// Opaque payload owned by the subchannel's protocol.
    pub payload: Value,
}

impl Frame {
    /// Creates a frame addressed to `channel`.
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// An uncorrelated command: what callers hand to the engine before an id is
/// attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Command kind, e.g. `ping` or `installPlugin`.
    pub command: String,
    /// Command-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl CommandMessage {
    /// Creates a command with no payload.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: Value::Null,
        }
    }

    /// Creates a command carrying `data`.
    pub fn with_data(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// A command request as written to the wire: `{id, command, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation id, monotonic per worker.
    pub id: u64,
    #[serde(flatten)]
    pub message: CommandMessage,
}

/// A command response correlated by id: `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl CommandResponse {
    /// Creates a success response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn err(id: u64, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapses the response into the caller-visible outcome.
    /// An `error` field wins over `result` if a peer ever sends both.
    pub fn into_outcome(self) -> Result<Value, Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
