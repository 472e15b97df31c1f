//! Plugin host for the Florin wallet platform.
//!
//! Fetches plugins, walks them through permission authorization, and runs
//! each one in its own supervised worker. Host capabilities reach a plugin
//! only through a per-plugin allow-list built from its approved
//! permissions, and origin-facing RPC crosses a permission gate before it
//! reaches anything else.
//!
//! # Components
//!
//! - **Controller**: owns plugin records and drives the add, authorize,
//!   start lifecycle
//! - **Supervisor**: owns workers and the command channels into them
//! - **Capability table**: the host methods one plugin may invoke
//! - **Gate**: middleware intercepting account and plugin RPC methods
//!
//! Workers talk to the host over a multiplexed duplex transport from
//! `florin-channel`, carrying command, rpc and background api lanes.
//!
//! # Example
//!
//! ```
//! use florin_plugin_host::{host_method, CapabilityTable};
//! use serde_json::json;
//!
//! tokio_test::block_on(async {
//!     let mut table = CapabilityTable::new("calculator");
//!     table.insert("double", host_method(|params| async move {
//!         Ok(json!(params.as_i64().unwrap_or(0) * 2))
//!     }));
//!
//!     assert_eq!(table.invoke("double", json!(21)).await.unwrap(), json!(42));
//!     assert!(table.invoke("transfer", json!(null)).await.is_err());
//! });
//! ```

mod agent;
mod capability;
mod controller;
mod error;
pub mod evaluator;
mod events;
mod gate;
mod rpc;
mod workers;

pub use agent::ApiClient;
pub use capability::{
    api_key, host_method, CapabilityRegistry, CapabilityTable, HostMethodFn, BUILTIN_GET_APP_KEY,
    BUILTIN_GET_PLUGIN_STATE, BUILTIN_UPDATE_PLUGIN_STATE, HOST_METHOD_PREFIX,
};
pub use controller::{
    GrantedPermission, HostApi, PermissionBroker, PluginController, PluginControllerOptions,
    PluginRecord, PluginStatus, ProcessedPlugin, ResolvedPlugin, RpcMessageHandler,
    SerializablePlugin, SourceResolver, PLUGIN_PREFIX,
};
pub use error::{PluginHostError, PluginHostResult};
pub use evaluator::{PluginInstance, SandboxEvaluator, WorkerEndowments};
pub use events::{EventBus, SubscriptionHandle};
pub use gate::{
    AccountSource, DomainMetadata, GateOutcome, PermissionGate, INTERNAL_ORIGIN, UNKNOWN_DOMAIN,
};
pub use rpc::{
    serialize_error, ErrorObject, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
};
pub use workers::{
    ConnectionHub, StartPluginArgs, SupervisorConfig, WorkerMetadata, WorkerSupervisor,
    CHANNEL_BACKGROUND_API, CHANNEL_COMMAND, CHANNEL_RPC, DEFAULT_HANDSHAKE_TIMEOUT,
};
