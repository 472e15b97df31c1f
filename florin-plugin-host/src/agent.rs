//! Worker-side agent.
//!
//! Each worker runs one agent task. It splits its end of the duplex
//! transport into the agreed subchannels, then answers host commands on the
//! command subchannel: `ping` for the readiness handshake, `installPlugin`
//! to hand source to the sandbox evaluator, `pluginRpc` and `hostEvent` to
//! dispatch into the installed instance. The background api subchannel runs
//! in the opposite direction and carries the plugin's calls back into the
//! host through an [`ApiClient`].

use crate::error::{PluginHostError, PluginHostResult};
use crate::evaluator::{PluginInstance, SandboxEvaluator, WorkerEndowments};
use crate::rpc::serialize_error;
use crate::workers::{
    StartPluginArgs, CHANNEL_BACKGROUND_API, CHANNEL_COMMAND, CHANNEL_RPC, COMMAND_HOST_EVENT,
    COMMAND_INSTALL_PLUGIN, COMMAND_PING, COMMAND_PLUGIN_RPC,
};
use async_trait::async_trait;
use florin_channel::{
    serve_commands, CommandEngine, CommandHandler, CommandMessage, Duplex, Multiplexer, Subchannel,
};
use florin_types::WorkerId;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key-restricted client for host methods, served over the background api
/// subchannel.
///
/// The key list is fixed at install time from the plugin's approved
/// permissions; the host end enforces the same list, so the check here only
/// changes where the refusal happens, not whether.
pub struct ApiClient {
    plugin_name: String,
    keys: Vec<String>,
    engine: Arc<CommandEngine>,
}

impl ApiClient {
    /// The bare api names this client may invoke.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Invokes a host method by bare api name.
    pub async fn invoke(&self, method: &str, params: Value) -> PluginHostResult<Value> {
        if !self.keys.iter().any(|key| key == method) {
            return Err(PluginHostError::PermissionDenied {
                plugin_name: self.plugin_name.clone(),
                method: method.to_string(),
            });
        }
        let message = CommandMessage::with_data(method, params);
        Ok(self.engine.command(message, None).await?)
    }
}

#[derive(Debug, Deserialize)]
struct PluginRpcArgs {
    origin: String,
    request: Value,
}

#[derive(Debug, Deserialize)]
struct HostEventArgs {
    event: String,
    #[serde(default)]
    payload: Value,
}

struct InstalledPlugin {
    plugin_name: String,
    instance: Arc<dyn PluginInstance>,
}

struct Agent {
    worker_id: WorkerId,
    evaluator: Arc<dyn SandboxEvaluator>,
    api_engine: Arc<CommandEngine>,
    rpc: Mutex<Option<Subchannel>>,
    installed: Mutex<Option<InstalledPlugin>>,
}

impl Agent {
    async fn install_plugin(&self, data: Value) -> Result<Value, Value> {
        let args: StartPluginArgs = serde_json::from_value(data)
            .map_err(|e| json!({ "message": format!("malformed installPlugin arguments: {e}") }))?;

        if self.installed.lock().await.is_some() {
            return Err(json!({
                "message": format!("worker {} already has a plugin installed", self.worker_id),
            }));
        }
        let Some(rpc) = self.rpc.lock().await.take() else {
            return Err(json!({ "message": "rpc endowment already consumed by a failed install" }));
        };

        let api = ApiClient {
            plugin_name: args.plugin_name.clone(),
            keys: args.background_api_keys.clone(),
            engine: Arc::clone(&self.api_engine),
        };

        info!(worker_id = %self.worker_id, plugin_name = %args.plugin_name, "installing plugin");
        let endowments = WorkerEndowments { rpc, api };
        match self
            .evaluator
            .evaluate(&args.plugin_name, &args.source_code, endowments)
            .await
        {
            Ok(instance) => {
                *self.installed.lock().await = Some(InstalledPlugin {
                    plugin_name: args.plugin_name,
                    instance: Arc::from(instance),
                });
                Ok(json!({ "response": "OK" }))
            }
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    plugin_name = %args.plugin_name,
                    error = %e,
                    "plugin evaluation failed"
                );
                Err(serialize_error(&e))
            }
        }
    }

    async fn installed_instance(&self) -> Result<(String, Arc<dyn PluginInstance>), Value> {
        match self.installed.lock().await.as_ref() {
            Some(plugin) => Ok((plugin.plugin_name.clone(), Arc::clone(&plugin.instance))),
            None => Err(json!({ "message": "no plugin installed in this worker" })),
        }
    }

    async fn plugin_rpc(&self, data: Value) -> Result<Value, Value> {
        let args: PluginRpcArgs = serde_json::from_value(data)
            .map_err(|e| json!({ "message": format!("malformed pluginRpc arguments: {e}") }))?;
        let (plugin_name, instance) = self.installed_instance().await?;
        debug!(
            worker_id = %self.worker_id,
            plugin_name = %plugin_name,
            origin = %args.origin,
            "dispatching plugin rpc"
        );
        instance.handle_rpc(&args.origin, args.request).await
    }

    async fn host_event(&self, data: Value) -> Result<Value, Value> {
        let args: HostEventArgs = serde_json::from_value(data)
            .map_err(|e| json!({ "message": format!("malformed hostEvent arguments: {e}") }))?;
        let (plugin_name, instance) = self.installed_instance().await?;
        debug!(
            worker_id = %self.worker_id,
            plugin_name = %plugin_name,
            event = %args.event,
            "dispatching host event"
        );
        instance.handle_event(&args.event, args.payload).await;
        Ok(Value::Null)
    }
}

#[async_trait]
impl CommandHandler for Agent {
    async fn handle_command(&self, command: &str, data: Value) -> Result<Value, Value> {
        match command {
            COMMAND_PING => Ok(json!("OK")),
            COMMAND_INSTALL_PLUGIN => self.install_plugin(data).await,
            COMMAND_PLUGIN_RPC => self.plugin_rpc(data).await,
            COMMAND_HOST_EVENT => self.host_event(data).await,
            other => {
                warn!(worker_id = %self.worker_id, command = %other, "unrecognized command");
                Err(json!({ "message": format!("unrecognized command: {other}") }))
            }
        }
    }
}

/// Runs one worker until its transport closes.
///
/// Subchannels are registered before the pump starts, so the host's
/// handshake ping can never race registration.
pub(crate) async fn run_worker_agent(
    worker_id: WorkerId,
    transport: Duplex,
    evaluator: Arc<dyn SandboxEvaluator>,
) {
    let names = [CHANNEL_COMMAND, CHANNEL_RPC, CHANNEL_BACKGROUND_API];
    let (_mux, subchannels) =
        match Multiplexer::with_subchannels(transport, format!("worker-{worker_id}"), &names) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "worker agent failed to start");
                return;
            }
        };
    // One subchannel per requested name, in request order.
    let Ok([command, rpc, api]) = <[Subchannel; 3]>::try_from(subchannels) else {
        return;
    };

    let agent = Arc::new(Agent {
        worker_id,
        evaluator,
        api_engine: Arc::new(CommandEngine::new(worker_id, api)),
        rpc: Mutex::new(Some(rpc)),
        installed: Mutex::new(None),
    });

    debug!(worker_id = %worker_id, "worker agent running");
    serve_commands(command, agent).await;
    debug!(worker_id = %worker_id, "worker agent stopped");
}
