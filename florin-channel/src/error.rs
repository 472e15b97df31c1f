//! Error types for the channel layer.

use florin_types::WorkerId;
use thiserror::Error;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur on a worker link.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport or subchannel is closed.
    #[error("channel closed: {0}")]
    Closed(String),

    /// A subchannel name was registered twice on one multiplexer.
    #[error("subchannel already registered: {0}")]
    DuplicateSubchannel(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No response arrived within the per-command deadline.
    #[error("worker {worker_id} took too long to respond to {command} command with id {id}")]
    CommandTimeout {
        worker_id: WorkerId,
        command: String,
        id: u64,
    },

    /// The remote end answered the command with an error payload.
    #[error("command failed: {0}")]
    CommandFailed(serde_json::Value),
}

impl ChannelError {
    /// Whether this error is the per-command deadline expiring.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommandTimeout { .. })
    }
}
