//! Permission-gate middleware for origin-facing RPC.
//!
//! The gate sits in front of the host's RPC stack and intercepts the
//! account and plugin methods. Everything else passes through untouched as
//! [`GateOutcome::Forward`].

use crate::controller::{PluginController, PLUGIN_PREFIX};
use crate::rpc::ErrorObject;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Origin used by the host's own UI surfaces. Never collected as a domain.
pub const INTERNAL_ORIGIN: &str = "florin";

/// Display name recorded when an origin is not a parseable URL.
pub const UNKNOWN_DOMAIN: &str = "Unknown Domain";

/// What the gate decided about one inbound request.
#[derive(Debug)]
pub enum GateOutcome {
    /// The gate produced the response itself.
    Handled(Result<Value, ErrorObject>),
    /// Not a gated method; the caller forwards it down its stack.
    Forward,
}

/// Site metadata collected per origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMetadata {
    /// Human-readable site name. A payload without one does not deserialize
    /// and is discarded on intake.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
}

/// The wallet's view of account exposure per origin.
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Accounts currently exposed to an origin. Empty when the origin holds
    /// no account permission.
    async fn accounts(&self, origin: &str) -> anyhow::Result<Vec<String>>;

    /// Prompts the user to grant the origin account access.
    async fn request_accounts_permission(&self, origin: &str) -> anyhow::Result<()>;
}

/// Intercepts account and plugin RPC methods for one wallet.
pub struct PermissionGate {
    accounts: Arc<dyn AccountSource>,
    controller: Arc<PluginController>,
    metadata: Mutex<HashMap<String, DomainMetadata>>,
}

impl PermissionGate {
    pub fn new(accounts: Arc<dyn AccountSource>, controller: Arc<PluginController>) -> Self {
        Self {
            accounts,
            controller,
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one request.
    ///
    /// Requests without a string `method` are rejected outright. Only a
    /// forwarded method records first-contact metadata for an external
    /// origin; gated methods leave an unknown origin unrecorded.
    pub async fn handle(&self, origin: &str, request: &Value) -> GateOutcome {
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return GateOutcome::Handled(Err(ErrorObject::invalid_request(request.clone())));
        };

        match method {
            "eth_accounts" => self.handle_accounts(origin).await,
            "eth_requestAccounts" => self.handle_request_accounts(origin).await,
            "wallet_installPlugins" => self.handle_install_plugins(origin, request).await,
            "wallet_sendDomainMetadata" => self.handle_domain_metadata(origin, request).await,
            _ => {
                self.record_first_contact(origin).await;
                GateOutcome::Forward
            }
        }
    }

    async fn handle_accounts(&self, origin: &str) -> GateOutcome {
        match self.accounts.accounts(origin).await {
            Ok(accounts) => GateOutcome::Handled(Ok(json!(accounts))),
            Err(e) => GateOutcome::Handled(Err(ErrorObject::internal(e.to_string()))),
        }
    }

    /// Grants account access if needed, then returns the exposed accounts.
    ///
    /// A granted permission that still yields no accounts is a host bug and
    /// is reported as one.
    async fn handle_request_accounts(&self, origin: &str) -> GateOutcome {
        let accounts = match self.accounts.accounts(origin).await {
            Ok(accounts) => accounts,
            Err(e) => return GateOutcome::Handled(Err(ErrorObject::internal(e.to_string()))),
        };
        if !accounts.is_empty() {
            return GateOutcome::Handled(Ok(json!(accounts)));
        }

        if let Err(e) = self.accounts.request_accounts_permission(origin).await {
            return GateOutcome::Handled(Err(ErrorObject::internal(e.to_string())));
        }

        match self.accounts.accounts(origin).await {
            Ok(accounts) if !accounts.is_empty() => GateOutcome::Handled(Ok(json!(accounts))),
            Ok(_) => {
                warn!(origin = %origin, "no accounts after a granted account permission");
                GateOutcome::Handled(Err(ErrorObject::internal(
                    "Accounts unexpectedly unavailable. Please report this bug.",
                )))
            }
            Err(e) => GateOutcome::Handled(Err(ErrorObject::internal(e.to_string()))),
        }
    }

    async fn handle_install_plugins(&self, origin: &str, request: &Value) -> GateOutcome {
        let Some(requested) = request
            .get("params")
            .and_then(|params| params.get(0))
            .and_then(Value::as_object)
        else {
            return GateOutcome::Handled(Err(ErrorObject::invalid_params(request.clone())));
        };

        if !requested.keys().any(|key| key.starts_with(PLUGIN_PREFIX)) {
            return GateOutcome::Handled(Err(ErrorObject::invalid_params_with_message(
                "Must request at least one plugin.",
                request.clone(),
            )));
        }

        let permission_names: Vec<String> = requested.keys().cloned().collect();
        match self
            .controller
            .install_plugins(origin, &permission_names)
            .await
        {
            Ok(result) => GateOutcome::Handled(Ok(result)),
            Err(e) => GateOutcome::Handled(Err(ErrorObject::internal(e.to_string()))),
        }
    }

    /// Stores site-provided metadata. Always answers `true`, even when the
    /// payload is unusable.
    async fn handle_domain_metadata(&self, origin: &str, request: &Value) -> GateOutcome {
        let incoming = request
            .get("params")
            .and_then(|params| params.get(0))
            .cloned()
            .and_then(|value| serde_json::from_value::<DomainMetadata>(value).ok());
        if let Some(incoming) = incoming {
            self.insert_metadata(origin, incoming).await;
        } else {
            debug!(origin = %origin, "discarding malformed domain metadata");
        }
        GateOutcome::Handled(Ok(Value::Bool(true)))
    }

    /// Merges incoming metadata for an origin. An extension id recorded
    /// earlier survives whatever the site sends later.
    async fn insert_metadata(&self, origin: &str, incoming: DomainMetadata) {
        let mut metadata = self.metadata.lock().await;
        let merged = match metadata.get(origin) {
            Some(existing) if existing.extension_id.is_some() => DomainMetadata {
                extension_id: existing.extension_id.clone(),
                ..incoming
            },
            _ => incoming,
        };
        debug!(origin = %origin, name = %merged.name, "domain metadata updated");
        metadata.insert(origin.to_string(), merged);
    }

    async fn record_first_contact(&self, origin: &str) {
        if origin == INTERNAL_ORIGIN {
            return;
        }
        let mut metadata = self.metadata.lock().await;
        if metadata.contains_key(origin) {
            return;
        }
        let name = Url::parse(origin)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_DOMAIN.to_string());
        debug!(origin = %origin, name = %name, "recording first contact");
        metadata.insert(
            origin.to_string(),
            DomainMetadata {
                name,
                extension_id: None,
            },
        );
    }

    /// Metadata recorded for an origin, if any.
    pub async fn metadata_for(&self, origin: &str) -> Option<DomainMetadata> {
        self.metadata.lock().await.get(origin).cloned()
    }
}
