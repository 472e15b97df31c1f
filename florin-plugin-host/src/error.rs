//! Error types for the plugin host.

use florin_channel::ChannelError;
use florin_types::WorkerId;
use thiserror::Error;

/// Result type for plugin host operations.
pub type PluginHostResult<T> = Result<T, PluginHostError>;

/// Errors that can occur in the plugin host.
#[derive(Debug, Error)]
pub enum PluginHostError {
    /// Plugin not found in the record table.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Worker not found in the live worker table.
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// A plugin name that is empty or otherwise unusable.
    #[error("invalid plugin name: {0:?}")]
    InvalidPluginName(String),

    /// Fetching or parsing a plugin's source failed.
    #[error("problem loading plugin {plugin_name}: {reason}")]
    Resolution { plugin_name: String, reason: String },

    /// The permission prompt failed or the user rejected it.
    #[error("permission request for '{plugin_name}' failed: {source}")]
    Authorization {
        plugin_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The sandbox raised while evaluating plugin code.
    #[error("error running plugin '{plugin_name}': {source}")]
    Execution {
        plugin_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A fresh worker never answered the readiness ping.
    #[error("worker {worker_id} failed handshake within {timeout_ms}ms")]
    HandshakeTimeout { worker_id: WorkerId, timeout_ms: u64 },

    /// A plugin invoked a host method outside its capability table.
    #[error("permission denied: plugin '{plugin_name}' may not call '{method}'")]
    PermissionDenied { plugin_name: String, method: String },

    /// A granted host method failed while executing.
    #[error("host method '{method}' failed: {reason}")]
    HostMethodFailed { method: String, reason: String },

    /// Channel-layer failure on a worker link.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
