//! Permission-scoped host method tables.
//!
//! The host exposes a fixed [`CapabilityRegistry`] of named methods. When a
//! plugin starts, the registry is filtered down to a per-plugin
//! [`CapabilityTable`] holding only the methods its approved permissions
//! name, plus the built-ins every plugin gets. The table is what gets served
//! to the worker over the background api subchannel.

use crate::error::{PluginHostError, PluginHostResult};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Namespace prefix for host method permissions.
pub const HOST_METHOD_PREFIX: &str = "florin_";

/// Built-in: replaces the plugin's persisted state.
pub const BUILTIN_UPDATE_PLUGIN_STATE: &str = "updatePluginState";

/// Built-in: returns the plugin's persisted state.
pub const BUILTIN_GET_PLUGIN_STATE: &str = "getPluginState";

/// Built-in: returns the plugin's domain-scoped app key. Always granted.
pub const BUILTIN_GET_APP_KEY: &str = "getAppKey";

/// A host method bound to whatever context it needs.
pub type HostMethodFn = Arc<dyn Fn(Value) -> BoxFuture<'static, PluginHostResult<Value>> + Send + Sync>;

/// Wraps an async closure as a [`HostMethodFn`].
pub fn host_method<F, Fut>(f: F) -> HostMethodFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PluginHostResult<Value>> + Send + 'static,
{
    Arc::new(move |params| f(params).boxed())
}

/// Strips the host method namespace from a permission name.
///
/// Permissions that are not host-namespaced (plugin permissions, external
/// ones) pass through unchanged.
#[must_use]
pub fn api_key(permission: &str) -> &str {
    permission
        .strip_prefix(HOST_METHOD_PREFIX)
        .unwrap_or(permission)
}

/// The host's full set of grantable methods, keyed by bare api name.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    methods: HashMap<String, HostMethodFn>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method under its bare api name.
    pub fn register(&mut self, name: impl Into<String>, method: HostMethodFn) {
        self.methods.insert(name.into(), method);
    }

    /// Whether a bare api name is a known host method.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// All registered bare api names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&HostMethodFn> {
        self.methods.get(name)
    }
}

/// One plugin's allow-list of invocable host methods.
pub struct CapabilityTable {
    plugin_name: String,
    methods: HashMap<String, HostMethodFn>,
}

impl CapabilityTable {
    #[must_use]
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            methods: HashMap::new(),
        }
    }

    /// The plugin this table was built for.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Adds a method to the allow-list.
    pub fn insert(&mut self, name: impl Into<String>, method: HostMethodFn) {
        self.methods.insert(name.into(), method);
    }

    /// The allow-listed method names, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.methods.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Invokes an allow-listed method. Methods outside the table fail with
    /// a permission error, never a lookup panic.
    pub async fn invoke(&self, method: &str, params: Value) -> PluginHostResult<Value> {
        let Some(f) = self.methods.get(method) else {
            return Err(PluginHostError::PermissionDenied {
                plugin_name: self.plugin_name.clone(),
                method: method.to_string(),
            });
        };
        f(params).await
    }
}
