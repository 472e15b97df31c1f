//! Worker supervision.
//!
//! The supervisor owns every live worker. Creating one spawns the agent
//! task, wires the three agreed subchannels, hands the rpc subchannel to the
//! connection hub, serves the plugin's capability table over the background
//! api subchannel, and runs the readiness handshake. A worker enters the
//! live table only after it answers the handshake; a silent one is discarded
//! whole.

use crate::agent::run_worker_agent;
use crate::capability::CapabilityTable;
use crate::error::{PluginHostError, PluginHostResult};
use crate::evaluator::SandboxEvaluator;
use crate::rpc::serialize_error;
use async_trait::async_trait;
use florin_channel::{
    duplex_pair, serve_commands, ChannelError, ChannelResult, CommandEngine, CommandHandler,
    CommandMessage, Multiplexer, Subchannel,
};
use florin_types::WorkerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subchannel carrying lifecycle commands and their responses.
pub const CHANNEL_COMMAND: &str = "command";

/// Subchannel carrying the plugin's JSON-RPC traffic to the provider stack.
pub const CHANNEL_RPC: &str = "rpc";

/// Subchannel carrying the plugin's calls into its capability table.
pub const CHANNEL_BACKGROUND_API: &str = "backgroundApi";

pub(crate) const COMMAND_PING: &str = "ping";
pub(crate) const COMMAND_INSTALL_PLUGIN: &str = "installPlugin";
pub(crate) const COMMAND_PLUGIN_RPC: &str = "pluginRpc";
pub(crate) const COMMAND_HOST_EVENT: &str = "hostEvent";

/// Default deadline for the readiness handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Metadata describing the party a worker serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub hostname: String,
}

/// Arguments for installing a plugin into a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPluginArgs {
    pub plugin_name: String,
    pub source_code: String,
    pub background_api_keys: Vec<String>,
}

/// Wires worker rpc traffic into the host's provider stack.
#[async_trait]
pub trait ConnectionHub: Send + Sync {
    /// Attaches a fresh worker's rpc subchannel.
    async fn setup_worker_connection(&self, metadata: WorkerMetadata, rpc: Subchannel);

    /// Tears down every connection attributed to an origin.
    async fn close_all_connections(&self, origin: &str);
}

/// Tuning knobs for worker creation.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a fresh worker gets to answer the readiness ping.
    pub handshake_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Serves one plugin's capability table on the background api subchannel.
struct ApiHandler {
    table: CapabilityTable,
}

#[async_trait]
impl CommandHandler for ApiHandler {
    async fn handle_command(&self, command: &str, data: Value) -> Result<Value, Value> {
        self.table
            .invoke(command, data)
            .await
            .map_err(|e| serialize_error(&e))
    }
}

struct WorkerHandle {
    metadata: WorkerMetadata,
    engine: Arc<CommandEngine>,
    mux: Multiplexer,
    agent: JoinHandle<()>,
    api_server: JoinHandle<()>,
}

/// Worker table plus the plugin association maps. Guarded by one mutex so
/// the two association maps stay mutual inverses.
#[derive(Default)]
struct WorkerTables {
    workers: HashMap<WorkerId, WorkerHandle>,
    plugin_to_worker: HashMap<String, WorkerId>,
    worker_to_plugin: HashMap<WorkerId, String>,
}

/// Owns every live worker and its channels.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    evaluator: Arc<dyn SandboxEvaluator>,
    connections: Arc<dyn ConnectionHub>,
    tables: Mutex<WorkerTables>,
}

impl WorkerSupervisor {
    // ================================================================
    // Construction
    // ================================================================

    pub fn new(evaluator: Arc<dyn SandboxEvaluator>, connections: Arc<dyn ConnectionHub>) -> Self {
        Self::with_config(evaluator, connections, SupervisorConfig::default())
    }

    pub fn with_config(
        evaluator: Arc<dyn SandboxEvaluator>,
        connections: Arc<dyn ConnectionHub>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            config,
            evaluator,
            connections,
            tables: Mutex::new(WorkerTables::default()),
        }
    }

    // ================================================================
    // Worker lifecycle
    // ================================================================

    /// Spawns a worker, wires its channels, and waits for the readiness
    /// handshake. The worker is inserted into the live table only once the
    /// handshake succeeds.
    pub async fn create_worker(
        &self,
        metadata: WorkerMetadata,
        api: CapabilityTable,
    ) -> PluginHostResult<WorkerId> {
        let worker_id = WorkerId::new();
        let (host_end, worker_end) = duplex_pair();
        let agent = tokio::spawn(run_worker_agent(
            worker_id,
            worker_end,
            Arc::clone(&self.evaluator),
        ));

        let mux = Multiplexer::new(host_end, metadata.hostname.clone());
        let (command, rpc, api_sub) = match Self::register_host_channels(&mux).await {
            Ok(parts) => parts,
            Err(e) => {
                agent.abort();
                return Err(e.into());
            }
        };

        self.connections
            .setup_worker_connection(metadata.clone(), rpc)
            .await;
        let api_server = tokio::spawn(serve_commands(api_sub, Arc::new(ApiHandler { table: api })));
        let engine = Arc::new(CommandEngine::new(worker_id, command));

        debug!(worker_id = %worker_id, hostname = %metadata.hostname, "pinging new worker");
        let handshake = engine
            .command(
                CommandMessage::new(COMMAND_PING),
                Some(self.config.handshake_timeout),
            )
            .await;
        if let Err(e) = handshake {
            agent.abort();
            api_server.abort();
            mux.shutdown().await;
            warn!(worker_id = %worker_id, error = %e, "worker failed handshake, discarding");
            return Err(match e {
                ChannelError::CommandTimeout { .. } => PluginHostError::HandshakeTimeout {
                    worker_id,
                    timeout_ms: self.config.handshake_timeout.as_millis() as u64,
                },
                other => other.into(),
            });
        }

        let handle = WorkerHandle {
            metadata,
            engine,
            mux,
            agent,
            api_server,
        };
        self.tables.lock().await.workers.insert(worker_id, handle);
        info!(worker_id = %worker_id, "worker created");
        Ok(worker_id)
    }

    async fn register_host_channels(
        mux: &Multiplexer,
    ) -> ChannelResult<(Subchannel, Subchannel, Subchannel)> {
        Ok((
            mux.subchannel(CHANNEL_COMMAND).await?,
            mux.subchannel(CHANNEL_RPC).await?,
            mux.subchannel(CHANNEL_BACKGROUND_API).await?,
        ))
    }

    /// Installs a plugin into a worker.
    ///
    /// The association is recorded before the install command goes out, so
    /// termination cleanup stays correct even if the install dies mid-flight.
    pub async fn start_plugin(
        &self,
        worker_id: WorkerId,
        args: StartPluginArgs,
    ) -> PluginHostResult<Value> {
        {
            let mut tables = self.tables.lock().await;
            if !tables.workers.contains_key(&worker_id) {
                return Err(PluginHostError::WorkerNotFound(worker_id));
            }
            if let Some(previous) = tables
                .plugin_to_worker
                .insert(args.plugin_name.clone(), worker_id)
            {
                tables.worker_to_plugin.remove(&previous);
            }
            tables
                .worker_to_plugin
                .insert(worker_id, args.plugin_name.clone());
        }

        info!(worker_id = %worker_id, plugin_name = %args.plugin_name, "starting plugin in worker");
        let data = serde_json::to_value(&args)?;
        self.command(
            worker_id,
            CommandMessage::with_data(COMMAND_INSTALL_PLUGIN, data),
            None,
        )
        .await
    }

    /// Sends a correlated command to a worker and awaits its response.
    pub async fn command(
        &self,
        worker_id: WorkerId,
        message: CommandMessage,
        timeout: Option<Duration>,
    ) -> PluginHostResult<Value> {
        let engine = self.get_engine(worker_id).await?;
        Ok(engine.command(message, timeout).await?)
    }

    async fn get_engine(&self, worker_id: WorkerId) -> PluginHostResult<Arc<CommandEngine>> {
        self.tables
            .lock()
            .await
            .workers
            .get(&worker_id)
            .map(|handle| Arc::clone(&handle.engine))
            .ok_or(PluginHostError::WorkerNotFound(worker_id))
    }

    // ================================================================
    // Termination
    // ================================================================

    /// Stops a worker and forgets it. Terminating an unknown or
    /// already-terminated worker is a no-op.
    pub async fn terminate(&self, worker_id: WorkerId) {
        let handle = {
            let mut tables = self.tables.lock().await;
            let Some(handle) = tables.workers.remove(&worker_id) else {
                debug!(worker_id = %worker_id, "terminate: worker already gone");
                return;
            };
            if let Some(plugin_name) = tables.worker_to_plugin.remove(&worker_id) {
                tables.plugin_to_worker.remove(&plugin_name);
            }
            handle
        };

        handle.agent.abort();
        handle.api_server.abort();
        handle.mux.shutdown().await;
        info!(worker_id = %worker_id, hostname = %handle.metadata.hostname, "worker terminated");
    }

    /// Stops the worker running a plugin, if any.
    pub async fn terminate_worker_of(&self, plugin_name: &str) {
        let worker_id = self
            .tables
            .lock()
            .await
            .plugin_to_worker
            .get(plugin_name)
            .copied();
        match worker_id {
            Some(worker_id) => self.terminate(worker_id).await,
            None => debug!(plugin_name = %plugin_name, "no worker to terminate"),
        }
    }

    /// Stops every live worker.
    pub async fn terminate_all(&self) {
        let worker_ids: Vec<WorkerId> = self.tables.lock().await.workers.keys().copied().collect();
        for worker_id in worker_ids {
            self.terminate(worker_id).await;
        }
    }

    // ================================================================
    // Accessors
    // ================================================================

    /// The worker a plugin runs in, if it has one.
    pub async fn worker_for(&self, plugin_name: &str) -> Option<WorkerId> {
        self.tables
            .lock()
            .await
            .plugin_to_worker
            .get(plugin_name)
            .copied()
    }

    /// The plugin a worker runs, if one was started in it.
    pub async fn plugin_of(&self, worker_id: WorkerId) -> Option<String> {
        self.tables
            .lock()
            .await
            .worker_to_plugin
            .get(&worker_id)
            .cloned()
    }

    /// Number of live workers.
    pub async fn worker_count(&self) -> usize {
        self.tables.lock().await.workers.len()
    }
}
