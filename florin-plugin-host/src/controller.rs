//! Plugin lifecycle controller.
//!
//! A plugin is initialized in three phases:
//! - **Add**: fetch the plugin from its source and record it.
//! - **Authorize**: prompt for the plugin's requested permissions.
//! - **Start**: install the plugin into a fresh worker with a capability
//!   table scoped to what was approved.
//!
//! Removal is the absence of a record: removing a plugin tears down its
//! hooks, connections, worker, record, state and permissions, in that
//! order. There is no disabled state to resurrect from.

use crate::capability::{
    api_key, host_method, CapabilityRegistry, CapabilityTable, BUILTIN_GET_APP_KEY,
    BUILTIN_GET_PLUGIN_STATE, BUILTIN_UPDATE_PLUGIN_STATE, HOST_METHOD_PREFIX,
};
use crate::error::{PluginHostError, PluginHostResult};
use crate::evaluator::SandboxEvaluator;
use crate::events::{EventBus, SubscriptionHandle};
use crate::rpc::{error_message, serialize_error};
use crate::workers::{
    ConnectionHub, StartPluginArgs, SupervisorConfig, WorkerMetadata, WorkerSupervisor,
    COMMAND_HOST_EVENT, COMMAND_PLUGIN_RPC,
};
use async_trait::async_trait;
use florin_channel::{ChannelError, CommandMessage};
use florin_types::WorkerId;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Namespace prefix for plugin permissions.
pub const PLUGIN_PREFIX: &str = "wallet_plugin_";

/// Lifecycle phase of a plugin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Fetched and recorded, not yet authorized.
    Added,
    /// Authorization in progress or concluded without a start.
    Authorizing,
    /// Running in a worker.
    Active,
}

/// Everything the host tracks about one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub name: String,
    /// The namespaced permission an origin must hold to reach this plugin.
    pub permission_name: String,
    /// Requested permissions, keyed by name, values carrying caveats.
    pub initial_permissions: Map<String, Value>,
    pub source_code: String,
    /// Permission names actually granted. `None` until authorization
    /// concludes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_permissions: Option<Vec<String>>,
    pub status: PluginStatus,
}

impl PluginRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }

    /// The allow-list projection safe to hand outward. Source code and
    /// runtime fields never leave the controller this way.
    #[must_use]
    pub fn serializable(&self) -> SerializablePlugin {
        SerializablePlugin {
            name: self.name.clone(),
            permission_name: self.permission_name.clone(),
            initial_permissions: self.initial_permissions.clone(),
        }
    }
}

/// Allow-list projection of a [`PluginRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializablePlugin {
    pub name: String,
    pub permission_name: String,
    pub initial_permissions: Map<String, Value>,
}

/// Outcome of one requested plugin. Failures are captured as JSON-RPC error
/// values rather than raised, so one bad plugin cannot fail a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessedPlugin {
    Installed(SerializablePlugin),
    Failed { error: Value },
}

/// A fetched plugin: its requested permissions and source blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPlugin {
    #[serde(default)]
    pub initial_permissions: Map<String, Value>,
    pub source_code: String,
}

/// One granted capability, as reported by the permission broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedPermission {
    pub parent_capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<Value>,
}

/// Fetches and parses plugin sources.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Fetches a plugin's manifest and bundle from `source_url`.
    async fn resolve(&self, plugin_name: &str, source_url: &str) -> anyhow::Result<ResolvedPlugin>;
}

/// The host's long-lived permission system.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    /// Prompts for the requested permissions and returns the grants.
    async fn request_permissions(
        &self,
        plugin_name: &str,
        requested: &Map<String, Value>,
    ) -> anyhow::Result<Vec<GrantedPermission>>;

    /// The permissions currently granted to a plugin.
    async fn permissions_for(&self, plugin_name: &str) -> Vec<GrantedPermission>;

    /// Revokes every permission held by the given subjects.
    async fn remove_all_permissions_for(&self, plugin_names: &[String]);
}

/// Host-provided surface exposed to plugins.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// The grantable host methods, keyed by bare api name.
    fn methods(&self) -> CapabilityRegistry;

    /// A domain-scoped app key for a plugin.
    async fn app_key_for_domain(&self, domain: &str) -> anyhow::Result<String>;
}

/// Forwards origin-scoped RPC requests into a plugin's worker.
#[derive(Clone)]
pub struct RpcMessageHandler {
    plugin_name: String,
    worker_id: WorkerId,
    supervisor: Arc<WorkerSupervisor>,
}

impl RpcMessageHandler {
    /// The plugin this handler targets.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Sends one request into the plugin and awaits its response.
    pub async fn handle(&self, origin: &str, request: Value) -> PluginHostResult<Value> {
        let message = CommandMessage::with_data(
            COMMAND_PLUGIN_RPC,
            json!({ "origin": origin, "request": request }),
        );
        self.supervisor.command(self.worker_id, message, None).await
    }
}

/// Construction options for [`PluginController`].
pub struct PluginControllerOptions {
    pub resolver: Arc<dyn SourceResolver>,
    pub permissions: Arc<dyn PermissionBroker>,
    pub connections: Arc<dyn ConnectionHub>,
    pub host_api: Arc<dyn HostApi>,
    pub evaluator: Arc<dyn SandboxEvaluator>,
    pub events: EventBus,
    /// Records restored from a previous session.
    pub initial_plugins: HashMap<String, PluginRecord>,
    /// Plugin state restored from a previous session.
    pub initial_plugin_states: HashMap<String, Value>,
    pub supervisor_config: SupervisorConfig,
}

impl PluginControllerOptions {
    /// Options with empty initial state and default tuning.
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        permissions: Arc<dyn PermissionBroker>,
        connections: Arc<dyn ConnectionHub>,
        host_api: Arc<dyn HostApi>,
        evaluator: Arc<dyn SandboxEvaluator>,
    ) -> Self {
        Self {
            resolver,
            permissions,
            connections,
            host_api,
            evaluator,
            events: EventBus::default(),
            initial_plugins: HashMap::new(),
            initial_plugin_states: HashMap::new(),
            supervisor_config: SupervisorConfig::default(),
        }
    }
}

struct PluginHooks {
    worker_id: WorkerId,
    /// Dropped with the hooks entry, which aborts the forwarders.
    #[allow(dead_code)]
    subscriptions: Vec<SubscriptionHandle>,
}

type SharedRecords = Arc<Mutex<HashMap<String, PluginRecord>>>;
type SharedStates = Arc<Mutex<HashMap<String, Value>>>;
type AddFuture = Shared<BoxFuture<'static, Result<PluginRecord, String>>>;
type SharedAdding = Arc<Mutex<HashMap<String, AddFuture>>>;

/// Orchestrates plugin lifecycle end to end.
pub struct PluginController {
    records: SharedRecords,
    plugin_states: SharedStates,
    /// In-flight adds, for deduplicating concurrent requests.
    adding: SharedAdding,
    hooks: Mutex<HashMap<String, PluginHooks>>,
    registry: CapabilityRegistry,
    /// Bare names eligible for the legacy namespace rewrite.
    known_methods: Arc<HashSet<String>>,
    events: Arc<EventBus>,
    supervisor: Arc<WorkerSupervisor>,
    resolver: Arc<dyn SourceResolver>,
    permissions: Arc<dyn PermissionBroker>,
    connections: Arc<dyn ConnectionHub>,
    host_api: Arc<dyn HostApi>,
}

impl PluginController {
    // ================================================================
    // Construction
    // ================================================================

    pub fn new(options: PluginControllerOptions) -> Self {
        let registry = options.host_api.methods();
        let events = Arc::new(options.events);

        let mut known_methods: HashSet<String> = registry.names().into_iter().collect();
        known_methods.extend(events.names());
        known_methods.insert(BUILTIN_UPDATE_PLUGIN_STATE.to_string());
        known_methods.insert(BUILTIN_GET_PLUGIN_STATE.to_string());

        let supervisor = Arc::new(WorkerSupervisor::with_config(
            options.evaluator,
            Arc::clone(&options.connections),
            options.supervisor_config,
        ));

        let mut initial_plugins = options.initial_plugins;
        for record in initial_plugins.values_mut() {
            // Restored records have no live worker yet, whatever the
            // previous session persisted.
            if record.status == PluginStatus::Active {
                record.status = PluginStatus::Added;
            }
        }

        Self {
            records: Arc::new(Mutex::new(initial_plugins)),
            plugin_states: Arc::new(Mutex::new(options.initial_plugin_states)),
            adding: Arc::new(Mutex::new(HashMap::new())),
            hooks: Mutex::new(HashMap::new()),
            registry,
            known_methods: Arc::new(known_methods),
            events,
            supervisor,
            resolver: options.resolver,
            permissions: options.permissions,
            connections: options.connections,
            host_api: options.host_api,
        }
    }

    /// The worker supervisor backing this controller.
    #[must_use]
    pub fn supervisor(&self) -> Arc<WorkerSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// The host event bus plugins can subscribe to.
    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    // ================================================================
    // Add
    // ================================================================

    /// Fetches a plugin and records it.
    ///
    /// Concurrent adds for the same name share one fetch; every caller gets
    /// the same record. The in-flight marker survives until authorization
    /// concludes, or is cleared immediately on a failed fetch so the next
    /// attempt starts fresh.
    pub async fn add(
        &self,
        plugin_name: &str,
        source_url: Option<&str>,
    ) -> PluginHostResult<PluginRecord> {
        if plugin_name.is_empty() {
            return Err(PluginHostError::InvalidPluginName(plugin_name.to_string()));
        }

        let fut = {
            let mut adding = self.adding.lock().await;
            match adding.get(plugin_name) {
                Some(fut) => {
                    debug!(plugin_name = %plugin_name, "add already in flight, joining");
                    fut.clone()
                }
                None => {
                    let fut = Self::fetch_and_record(
                        Arc::clone(&self.resolver),
                        Arc::clone(&self.records),
                        Arc::clone(&self.adding),
                        Arc::clone(&self.known_methods),
                        plugin_name.to_string(),
                        source_url.unwrap_or(plugin_name).to_string(),
                    )
                    .boxed()
                    .shared();
                    adding.insert(plugin_name.to_string(), fut.clone());
                    fut
                }
            }
        };

        fut.await.map_err(|reason| PluginHostError::Resolution {
            plugin_name: plugin_name.to_string(),
            reason,
        })
    }

    async fn fetch_and_record(
        resolver: Arc<dyn SourceResolver>,
        records: SharedRecords,
        adding: SharedAdding,
        known_methods: Arc<HashSet<String>>,
        plugin_name: String,
        source_url: String,
    ) -> Result<PluginRecord, String> {
        info!(plugin_name = %plugin_name, source_url = %source_url, "fetching plugin source");
        let resolved = match resolver.resolve(&plugin_name, &source_url).await {
            Ok(resolved) => resolved,
            Err(e) => {
                // A failed fetch must not poison later attempts.
                adding.lock().await.remove(&plugin_name);
                warn!(plugin_name = %plugin_name, error = %e, "plugin fetch failed");
                return Err(e.to_string());
            }
        };

        // Bare host method names in a manifest are legacy; move them into
        // the florin namespace, caveats intact.
        let mut initial_permissions = resolved.initial_permissions;
        let legacy: Vec<String> = initial_permissions
            .keys()
            .filter(|name| known_methods.contains(*name))
            .cloned()
            .collect();
        for name in legacy {
            if let Some(caveats) = initial_permissions.remove(&name) {
                initial_permissions.insert(format!("{HOST_METHOD_PREFIX}{name}"), caveats);
            }
        }

        let fresh = PluginRecord {
            name: plugin_name.clone(),
            permission_name: format!("{PLUGIN_PREFIX}{plugin_name}"),
            initial_permissions,
            source_code: resolved.source_code,
            approved_permissions: None,
            status: PluginStatus::Added,
        };

        let mut records = records.lock().await;
        // Re-adding merges over the existing record: fetched fields win,
        // lifecycle fields survive.
        let record = match records.remove(&plugin_name) {
            Some(existing) => PluginRecord {
                approved_permissions: existing.approved_permissions,
                status: existing.status,
                ..fresh
            },
            None => fresh,
        };
        records.insert(plugin_name.clone(), record.clone());
        info!(plugin_name = %plugin_name, "plugin added");
        Ok(record)
    }

    // ================================================================
    // Authorize
    // ================================================================

    /// Prompts for the plugin's requested permissions and returns the
    /// granted permission names.
    ///
    /// A plugin that requests nothing is authorized with an empty grant and
    /// no prompt is ever shown.
    pub async fn authorize(&self, plugin_name: &str) -> PluginHostResult<Vec<String>> {
        info!(plugin_name = %plugin_name, "authorizing plugin");
        let initial_permissions = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(plugin_name)
                .ok_or_else(|| PluginHostError::PluginNotFound(plugin_name.to_string()))?;
            record.status = PluginStatus::Authorizing;
            record.initial_permissions.clone()
        };

        let result = if initial_permissions.is_empty() {
            Ok(Vec::new())
        } else {
            self.permissions
                .request_permissions(plugin_name, &initial_permissions)
                .await
                .map(|grants| {
                    grants
                        .into_iter()
                        .map(|grant| grant.parent_capability)
                        .collect()
                })
                .map_err(|e| PluginHostError::Authorization {
                    plugin_name: plugin_name.to_string(),
                    source: e,
                })
        };

        // Authorization concluded either way; the next add starts fresh.
        self.adding.lock().await.remove(plugin_name);

        if let Ok(approved) = &result {
            if let Some(record) = self.records.lock().await.get_mut(plugin_name) {
                record.approved_permissions = Some(approved.clone());
            }
        }
        result
    }

    // ================================================================
    // Start
    // ================================================================

    /// Runs the full add, authorize, start pipeline for one plugin.
    ///
    /// An already-active plugin short-circuits to its projection without
    /// touching the resolver or the broker. Failures come back as captured
    /// error values, never as raised errors.
    pub async fn process_requested_plugin(&self, plugin_name: &str) -> ProcessedPlugin {
        let already_active = {
            let records = self.records.lock().await;
            records
                .get(plugin_name)
                .filter(|record| record.is_active())
                .map(PluginRecord::serializable)
        };
        if let Some(serializable) = already_active {
            debug!(plugin_name = %plugin_name, "plugin already active");
            return ProcessedPlugin::Installed(serializable);
        }

        match self.install(plugin_name).await {
            Ok(serializable) => ProcessedPlugin::Installed(serializable),
            Err(e) => {
                warn!(plugin_name = %plugin_name, error = %e, "plugin installation failed");
                ProcessedPlugin::Failed {
                    error: serialize_error(&e),
                }
            }
        }
    }

    async fn install(&self, plugin_name: &str) -> PluginHostResult<SerializablePlugin> {
        let record = self.add(plugin_name, None).await?;
        let approved = self.authorize(plugin_name).await?;
        self.start_plugin_in_worker(plugin_name, &approved, &record.source_code)
            .await?;
        self.get_serializable(plugin_name)
            .await
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_name.to_string()))
    }

    /// Creates a worker for the plugin and installs it.
    ///
    /// If the install itself fails, the plugin is removed outright and the
    /// error re-raised; a partially started plugin is never left behind.
    async fn start_plugin_in_worker(
        &self,
        plugin_name: &str,
        approved: &[String],
        source_code: &str,
    ) -> PluginHostResult<()> {
        let api_list: Vec<String> = approved
            .iter()
            .map(|permission| api_key(permission).to_string())
            .collect();
        let table = self.build_capability_table(plugin_name, &api_list);
        let background_api_keys = table.keys();

        let worker_id = self
            .supervisor
            .create_worker(
                WorkerMetadata {
                    hostname: plugin_name.to_string(),
                },
                table,
            )
            .await?;

        // Hooks must exist before the install lands: the plugin may see
        // rpc traffic as soon as its code runs.
        self.create_plugin_hooks(plugin_name, worker_id, &api_list)
            .await;

        let started = self
            .supervisor
            .start_plugin(
                worker_id,
                StartPluginArgs {
                    plugin_name: plugin_name.to_string(),
                    source_code: source_code.to_string(),
                    background_api_keys,
                },
            )
            .await;

        match started {
            Ok(_) => {
                if let Some(record) = self.records.lock().await.get_mut(plugin_name) {
                    record.status = PluginStatus::Active;
                }
                info!(plugin_name = %plugin_name, worker_id = %worker_id, "plugin active");
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    PluginHostError::Channel(ChannelError::CommandFailed(error)) => {
                        PluginHostError::Execution {
                            plugin_name: plugin_name.to_string(),
                            source: anyhow::anyhow!(error_message(&error)),
                        }
                    }
                    other => other,
                };
                warn!(plugin_name = %plugin_name, error = %err, "plugin failed to start, removing it");
                self.remove_plugin(plugin_name).await;
                Err(err)
            }
        }
    }

    /// Builds the per-plugin allow-list of host methods.
    ///
    /// `getAppKey` is always present. State built-ins and registry methods
    /// join only when the approved api list names them; names matching
    /// nothing callable (host events, unknown grants) are skipped.
    fn build_capability_table(&self, plugin_name: &str, api_list: &[String]) -> CapabilityTable {
        let mut table = CapabilityTable::new(plugin_name);

        let host_api = Arc::clone(&self.host_api);
        let name = plugin_name.to_string();
        table.insert(
            BUILTIN_GET_APP_KEY,
            host_method(move |_params| {
                let host_api = Arc::clone(&host_api);
                let name = name.clone();
                async move {
                    host_api
                        .app_key_for_domain(&name)
                        .await
                        .map(Value::String)
                        .map_err(|e| PluginHostError::HostMethodFailed {
                            method: BUILTIN_GET_APP_KEY.to_string(),
                            reason: e.to_string(),
                        })
                }
            }),
        );

        for key in api_list {
            match key.as_str() {
                BUILTIN_UPDATE_PLUGIN_STATE => {
                    let states = Arc::clone(&self.plugin_states);
                    let name = plugin_name.to_string();
                    table.insert(
                        BUILTIN_UPDATE_PLUGIN_STATE,
                        host_method(move |params| {
                            let states = Arc::clone(&states);
                            let name = name.clone();
                            async move {
                                states.lock().await.insert(name, params);
                                Ok(Value::Null)
                            }
                        }),
                    );
                }
                BUILTIN_GET_PLUGIN_STATE => {
                    let states = Arc::clone(&self.plugin_states);
                    let name = plugin_name.to_string();
                    table.insert(
                        BUILTIN_GET_PLUGIN_STATE,
                        host_method(move |_params| {
                            let states = Arc::clone(&states);
                            let name = name.clone();
                            async move {
                                Ok(states.lock().await.get(&name).cloned().unwrap_or(Value::Null))
                            }
                        }),
                    );
                }
                _ => {
                    if let Some(method) = self.registry.get(key) {
                        table.insert(key.clone(), method.clone());
                    }
                }
            }
        }
        table
    }

    async fn create_plugin_hooks(
        &self,
        plugin_name: &str,
        worker_id: WorkerId,
        api_list: &[String],
    ) {
        let subscriptions = self.subscribe_worker_to_events(worker_id, api_list);
        self.hooks.lock().await.insert(
            plugin_name.to_string(),
            PluginHooks {
                worker_id,
                subscriptions,
            },
        );
    }

    /// Spawns a forwarder per approved host event, delivering each emission
    /// into the worker as a `hostEvent` command.
    fn subscribe_worker_to_events(
        &self,
        worker_id: WorkerId,
        api_list: &[String],
    ) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::new();
        for event_name in api_list {
            let Some(mut rx) = self.events.subscribe(event_name) else {
                continue;
            };
            debug!(worker_id = %worker_id, event = %event_name, "subscribing worker to host event");
            let supervisor = Arc::clone(&self.supervisor);
            let event = event_name.clone();
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => {
                            let message = CommandMessage::with_data(
                                COMMAND_HOST_EVENT,
                                json!({ "event": event, "payload": payload }),
                            );
                            match supervisor.command(worker_id, message, None).await {
                                Ok(_) => {}
                                Err(PluginHostError::WorkerNotFound(_)) => break,
                                Err(e) => {
                                    warn!(
                                        worker_id = %worker_id,
                                        event = %event,
                                        error = %e,
                                        "event delivery failed"
                                    );
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                worker_id = %worker_id,
                                event = %event,
                                skipped,
                                "event subscriber lagged"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            handles.push(SubscriptionHandle::new(event_name.clone(), forwarder));
        }
        handles
    }

    // ================================================================
    // Removal
    // ================================================================

    /// Removes one plugin. See [`Self::remove_plugins`].
    pub async fn remove_plugin(&self, plugin_name: &str) {
        self.remove_plugins(&[plugin_name.to_string()]).await;
    }

    /// Removes plugins: hooks, connections, worker, record and state per
    /// plugin, then one batched permission revocation.
    ///
    /// Every step tolerates absence, so half-started plugins clean up the
    /// same way fully started ones do.
    pub async fn remove_plugins(&self, plugin_names: &[String]) {
        for plugin_name in plugin_names {
            // Hooks first: forwarders die before their worker does.
            self.hooks.lock().await.remove(plugin_name);
            self.connections.close_all_connections(plugin_name).await;
            self.supervisor.terminate_worker_of(plugin_name).await;
            self.records.lock().await.remove(plugin_name);
            self.plugin_states.lock().await.remove(plugin_name);
            info!(plugin_name = %plugin_name, "plugin removed");
        }
        self.permissions
            .remove_all_permissions_for(plugin_names)
            .await;
    }

    /// Removes every plugin and resets all controller state.
    pub async fn clear_state(&self) {
        self.hooks.lock().await.clear();
        let plugin_names: Vec<String> = self.records.lock().await.keys().cloned().collect();
        self.records.lock().await.clear();
        self.plugin_states.lock().await.clear();
        for plugin_name in &plugin_names {
            self.connections.close_all_connections(plugin_name).await;
        }
        self.supervisor.terminate_all().await;
        self.permissions
            .remove_all_permissions_for(&plugin_names)
            .await;
        info!(count = plugin_names.len(), "plugin state cleared");
    }

    // ================================================================
    // Plugin state
    // ================================================================

    /// Replaces a plugin's persisted state.
    pub async fn update_plugin_state(&self, plugin_name: &str, state: Value) {
        self.plugin_states
            .lock()
            .await
            .insert(plugin_name.to_string(), state);
    }

    /// A plugin's persisted state, if it has any.
    pub async fn get_plugin_state(&self, plugin_name: &str) -> Option<Value> {
        self.plugin_states.lock().await.get(plugin_name).cloned()
    }

    // ================================================================
    // Accessors
    // ================================================================

    /// A full plugin record, cloned.
    pub async fn get_plugin(&self, plugin_name: &str) -> Option<PluginRecord> {
        self.records.lock().await.get(plugin_name).cloned()
    }

    pub async fn has_plugin(&self, plugin_name: &str) -> bool {
        self.records.lock().await.contains_key(plugin_name)
    }

    pub async fn plugin_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// A plugin's allow-list projection.
    pub async fn get_serializable(&self, plugin_name: &str) -> Option<SerializablePlugin> {
        self.records
            .lock()
            .await
            .get(plugin_name)
            .map(PluginRecord::serializable)
    }

    /// The projection of every record, keyed by plugin name.
    pub async fn serializable_plugins(&self) -> HashMap<String, SerializablePlugin> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(name, record)| (name.clone(), record.serializable()))
            .collect()
    }

    /// A handler for forwarding rpc requests into a running plugin, or
    /// `None` if the plugin has no worker hooks.
    pub async fn rpc_message_handler(&self, plugin_name: &str) -> Option<RpcMessageHandler> {
        self.hooks
            .lock()
            .await
            .get(plugin_name)
            .map(|hooks| RpcMessageHandler {
                plugin_name: plugin_name.to_string(),
                worker_id: hooks.worker_id,
                supervisor: Arc::clone(&self.supervisor),
            })
    }

    // ================================================================
    // Install surface
    // ================================================================

    /// Processes a batch of requested plugin permissions for an origin.
    ///
    /// Names are the namespaced `wallet_plugin_*` permissions; the result
    /// object is keyed the same way, mapping each to the installed
    /// projection or a captured error.
    pub async fn install_plugins(
        &self,
        origin: &str,
        requested: &[String],
    ) -> PluginHostResult<Value> {
        let mut result = Map::new();
        for permission_name in requested {
            let Some(plugin_name) = permission_name.strip_prefix(PLUGIN_PREFIX) else {
                debug!(origin = %origin, permission = %permission_name, "ignoring non-plugin permission");
                continue;
            };
            info!(origin = %origin, plugin_name = %plugin_name, "plugin requested");
            let processed = self.process_requested_plugin(plugin_name).await;
            result.insert(permission_name.clone(), serde_json::to_value(&processed)?);
        }
        Ok(Value::Object(result))
    }

    /// Restarts every recorded plugin with its already-granted permissions.
    /// A plugin that fails to start is removed; the sweep continues.
    pub async fn run_existing_plugins(&self) {
        let existing: Vec<PluginRecord> = self.records.lock().await.values().cloned().collect();
        if existing.is_empty() {
            info!("no existing plugins to run");
            return;
        }
        info!(count = existing.len(), "running existing plugins");
        for record in existing {
            let approved: Vec<String> = self
                .permissions
                .permissions_for(&record.name)
                .await
                .into_iter()
                .map(|grant| grant.parent_capability)
                .collect();
            if let Err(e) = self
                .start_plugin_in_worker(&record.name, &approved, &record.source_code)
                .await
            {
                warn!(plugin_name = %record.name, error = %e, "failed to start plugin, removing it");
                self.remove_plugin(&record.name).await;
            }
        }
    }
}
