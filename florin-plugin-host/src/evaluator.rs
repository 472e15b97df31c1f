//! Sandbox evaluator abstraction.
//!
//! The host never executes plugin code itself. A [`SandboxEvaluator`] turns a
//! source blob into a live [`PluginInstance`] inside whatever sandbox the
//! embedder provides, with the worker-side endowments as the instance's only
//! window back into the host.

use crate::agent::ApiClient;
use async_trait::async_trait;
use florin_channel::Subchannel;
use serde_json::Value;

/// Capabilities handed to a plugin instance at install time.
///
/// `rpc` is the raw JSON-RPC pipe into the host's provider stack; `api` is
/// the key-restricted client for host-provided methods. Nothing else crosses
/// the sandbox boundary.
pub struct WorkerEndowments {
    pub rpc: Subchannel,
    pub api: ApiClient,
}

/// A running plugin inside its sandbox.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// Handles one RPC request forwarded from an external origin.
    async fn handle_rpc(&self, origin: &str, request: Value) -> Result<Value, Value>;

    /// Delivers a host event the plugin subscribed to.
    async fn handle_event(&self, event: &str, payload: Value);
}

/// Evaluates plugin source under restricted globals.
#[async_trait]
pub trait SandboxEvaluator: Send + Sync {
    /// Runs `source_code` in a fresh sandbox and returns the live instance.
    async fn evaluate(
        &self,
        plugin_name: &str,
        source_code: &str,
        endowments: WorkerEndowments,
    ) -> anyhow::Result<Box<dyn PluginInstance>>;
}

/// A scripted evaluator for exercising the host without a real sandbox.
pub mod mock {
    use super::*;
    use crate::capability::{
        BUILTIN_GET_APP_KEY, BUILTIN_GET_PLUGIN_STATE, BUILTIN_UPDATE_PLUGIN_STATE,
    };
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Events observed by every instance a [`MockEvaluator`] produced.
    pub type EventLog = Arc<Mutex<Vec<(String, Value)>>>;

    /// Evaluator that produces [`EchoInstance`]s, or fails on demand.
    pub struct MockEvaluator {
        fail: bool,
        events: EventLog,
    }

    impl MockEvaluator {
        /// Evaluator whose instances echo requests back.
        pub fn new() -> Self {
            Self {
                fail: false,
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Evaluator whose `evaluate` always fails.
        pub fn failing() -> Self {
            Self {
                fail: true,
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Shared log of events delivered to produced instances.
        pub fn events(&self) -> EventLog {
            Arc::clone(&self.events)
        }
    }

    impl Default for MockEvaluator {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SandboxEvaluator for MockEvaluator {
        async fn evaluate(
            &self,
            plugin_name: &str,
            _source_code: &str,
            endowments: WorkerEndowments,
        ) -> anyhow::Result<Box<dyn PluginInstance>> {
            if self.fail {
                return Err(anyhow!("evaluation failed for '{plugin_name}'"));
            }
            Ok(Box::new(EchoInstance {
                plugin_name: plugin_name.to_string(),
                endowments,
                events: Arc::clone(&self.events),
            }))
        }
    }

    /// Instance that echoes RPC requests and can proxy host api calls.
    ///
    /// Recognized request methods:
    /// - `"call"`: invokes `params.method` on the host api with
    ///   `params.params`.
    /// - `"setState"` / `"getState"` / `"getAppKey"`: shorthand for the
    ///   corresponding built-in api methods.
    /// - `"stall"`: never answers.
    /// - anything else: echoed back with the calling origin.
    pub struct EchoInstance {
        plugin_name: String,
        endowments: WorkerEndowments,
        events: EventLog,
    }

    impl EchoInstance {
        async fn invoke(&self, method: &str, params: Value) -> Result<Value, Value> {
            self.endowments
                .api
                .invoke(method, params)
                .await
                .map_err(|e| json!({ "message": e.to_string() }))
        }
    }

    #[async_trait]
    impl PluginInstance for EchoInstance {
        async fn handle_rpc(&self, origin: &str, request: Value) -> Result<Value, Value> {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            match request.get("method").and_then(Value::as_str) {
                Some("call") => {
                    let method = params
                        .get("method")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let inner = params.get("params").cloned().unwrap_or(Value::Null);
                    self.invoke(&method, inner).await
                }
                Some("setState") => self.invoke(BUILTIN_UPDATE_PLUGIN_STATE, params).await,
                Some("getState") => self.invoke(BUILTIN_GET_PLUGIN_STATE, Value::Null).await,
                Some("getAppKey") => self.invoke(BUILTIN_GET_APP_KEY, Value::Null).await,
                Some("stall") => std::future::pending().await,
                _ => Ok(json!({
                    "plugin": self.plugin_name,
                    "origin": origin,
                    "request": request,
                })),
            }
        }

        async fn handle_event(&self, event: &str, payload: Value) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }
    }
}
