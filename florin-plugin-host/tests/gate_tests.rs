//! Integration tests for the permission gate: method interception, the
//! account flows, plugin installation params and domain metadata.

use florin_plugin_host::evaluator::mock::MockEvaluator;
use florin_plugin_host::*;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ================================================================
// Test collaborators
// ================================================================

/// Account source with a scripted grant flow.
#[derive(Default)]
struct TestAccounts {
    exposed: Vec<String>,
    granted: Mutex<HashSet<String>>,
    reject_grant: bool,
    requests: AtomicUsize,
}

impl TestAccounts {
    fn with_accounts(accounts: &[&str]) -> Self {
        Self {
            exposed: accounts.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    fn rejecting() -> Self {
        Self {
            reject_grant: true,
            ..Self::default()
        }
    }

    fn grant(&self, origin: &str) {
        self.granted.lock().unwrap().insert(origin.to_string());
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AccountSource for TestAccounts {
    async fn accounts(&self, origin: &str) -> anyhow::Result<Vec<String>> {
        if self.granted.lock().unwrap().contains(origin) {
            Ok(self.exposed.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn request_accounts_permission(&self, origin: &str) -> anyhow::Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.reject_grant {
            anyhow::bail!("user rejected the request");
        }
        self.grant(origin);
        Ok(())
    }
}

/// Resolver knowing exactly one permissionless plugin.
struct StaticResolver;

#[async_trait::async_trait]
impl SourceResolver for StaticResolver {
    async fn resolve(&self, plugin_name: &str, _source_url: &str) -> anyhow::Result<ResolvedPlugin> {
        if plugin_name == "calculator" {
            Ok(ResolvedPlugin {
                initial_permissions: Map::new(),
                source_code: "exports.calc = 1;".to_string(),
            })
        } else {
            anyhow::bail!("unknown plugin {plugin_name}")
        }
    }
}

struct GrantAllBroker;

#[async_trait::async_trait]
impl PermissionBroker for GrantAllBroker {
    async fn request_permissions(
        &self,
        _plugin_name: &str,
        requested: &Map<String, Value>,
    ) -> anyhow::Result<Vec<GrantedPermission>> {
        Ok(requested
            .keys()
            .map(|name| GrantedPermission {
                parent_capability: name.clone(),
                caveats: None,
            })
            .collect())
    }

    async fn permissions_for(&self, _plugin_name: &str) -> Vec<GrantedPermission> {
        Vec::new()
    }

    async fn remove_all_permissions_for(&self, _plugin_names: &[String]) {}
}

struct NullHub;

#[async_trait::async_trait]
impl ConnectionHub for NullHub {
    async fn setup_worker_connection(
        &self,
        _metadata: WorkerMetadata,
        _rpc: florin_channel::Subchannel,
    ) {
    }

    async fn close_all_connections(&self, _origin: &str) {}
}

struct NullHostApi;

#[async_trait::async_trait]
impl HostApi for NullHostApi {
    fn methods(&self) -> CapabilityRegistry {
        CapabilityRegistry::new()
    }

    async fn app_key_for_domain(&self, domain: &str) -> anyhow::Result<String> {
        Ok(format!("key-{domain}"))
    }
}

fn make_controller() -> Arc<PluginController> {
    Arc::new(PluginController::new(PluginControllerOptions::new(
        Arc::new(StaticResolver),
        Arc::new(GrantAllBroker),
        Arc::new(NullHub),
        Arc::new(NullHostApi),
        Arc::new(MockEvaluator::new()),
    )))
}

fn make_gate(accounts: TestAccounts) -> (PermissionGate, Arc<TestAccounts>) {
    let accounts = Arc::new(accounts);
    let gate = PermissionGate::new(accounts.clone(), make_controller());
    (gate, accounts)
}

fn handled_ok(outcome: GateOutcome) -> Value {
    match outcome {
        GateOutcome::Handled(Ok(value)) => value,
        other => panic!("Expected Handled(Ok), got {other:?}"),
    }
}

fn handled_err(outcome: GateOutcome) -> ErrorObject {
    match outcome {
        GateOutcome::Handled(Err(error)) => error,
        other => panic!("Expected Handled(Err), got {other:?}"),
    }
}

// ================================================================
// Routing
// ================================================================

#[tokio::test]
async fn non_string_method_is_rejected() {
    let (gate, _) = make_gate(TestAccounts::default());

    let err = handled_err(gate.handle("https://dapp.example", &json!({ "method": 5 })).await);
    assert_eq!(err.code, INVALID_REQUEST);

    let err = handled_err(gate.handle("https://dapp.example", &json!({})).await);
    assert_eq!(err.code, INVALID_REQUEST);
}

#[tokio::test]
async fn unknown_methods_are_forwarded() {
    let (gate, _) = make_gate(TestAccounts::default());
    let outcome = gate
        .handle("https://dapp.example", &json!({ "method": "eth_chainId" }))
        .await;
    assert!(matches!(outcome, GateOutcome::Forward));
}

// ================================================================
// Account methods
// ================================================================

#[tokio::test]
async fn eth_accounts_returns_the_exposed_accounts() {
    let (gate, accounts) = make_gate(TestAccounts::with_accounts(&["0xabc"]));
    accounts.grant("https://dapp.example");

    let value = handled_ok(
        gate.handle("https://dapp.example", &json!({ "method": "eth_accounts" }))
            .await,
    );
    assert_eq!(value, json!(["0xabc"]));

    // An origin without a grant sees an empty list, not an error.
    let value = handled_ok(
        gate.handle("https://other.example", &json!({ "method": "eth_accounts" }))
            .await,
    );
    assert_eq!(value, json!([]));
}

#[tokio::test]
async fn request_accounts_skips_the_prompt_when_already_granted() {
    let (gate, accounts) = make_gate(TestAccounts::with_accounts(&["0xabc"]));
    accounts.grant("https://dapp.example");

    let value = handled_ok(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "eth_requestAccounts" }),
        )
        .await,
    );

    assert_eq!(value, json!(["0xabc"]));
    assert_eq!(accounts.requests(), 0);
}

#[tokio::test]
async fn request_accounts_prompts_then_returns() {
    let (gate, accounts) = make_gate(TestAccounts::with_accounts(&["0xabc"]));

    let value = handled_ok(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "eth_requestAccounts" }),
        )
        .await,
    );

    assert_eq!(value, json!(["0xabc"]));
    assert_eq!(accounts.requests(), 1);
}

#[tokio::test]
async fn request_accounts_rejection_surfaces_as_an_error() {
    let (gate, accounts) = make_gate(TestAccounts::rejecting());

    let err = handled_err(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "eth_requestAccounts" }),
        )
        .await,
    );

    assert_eq!(err.code, INTERNAL_ERROR);
    assert!(err.message.contains("user rejected"), "got {:?}", err.message);
    assert_eq!(accounts.requests(), 1);
}

#[tokio::test]
async fn request_accounts_with_no_accounts_reports_a_bug() {
    // Grant succeeds but the wallet exposes nothing.
    let (gate, accounts) = make_gate(TestAccounts::with_accounts(&[]));

    let err = handled_err(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "eth_requestAccounts" }),
        )
        .await,
    );

    assert_eq!(err.code, INTERNAL_ERROR);
    assert_eq!(
        err.message,
        "Accounts unexpectedly unavailable. Please report this bug."
    );
    assert_eq!(accounts.requests(), 1);
}

// ================================================================
// wallet_installPlugins
// ================================================================

#[tokio::test]
async fn install_plugins_requires_object_params() {
    let (gate, _) = make_gate(TestAccounts::default());

    let err = handled_err(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "wallet_installPlugins" }),
        )
        .await,
    );
    assert_eq!(err.code, INVALID_PARAMS);

    let err = handled_err(
        gate.handle(
            "https://dapp.example",
            &json!({ "method": "wallet_installPlugins", "params": [5] }),
        )
        .await,
    );
    assert_eq!(err.code, INVALID_PARAMS);
}

#[tokio::test]
async fn install_plugins_requires_at_least_one_plugin() {
    let (gate, _) = make_gate(TestAccounts::default());

    let request = json!({
        "method": "wallet_installPlugins",
        "params": [{ "eth_accounts": {} }],
    });
    let err = handled_err(gate.handle("https://dapp.example", &request).await);

    assert_eq!(err.code, INVALID_PARAMS);
    assert_eq!(err.message, "Must request at least one plugin.");
    assert_eq!(err.data, Some(request));
}

#[tokio::test]
async fn install_plugins_installs_and_reports() {
    let (gate, _) = make_gate(TestAccounts::default());

    let request = json!({
        "method": "wallet_installPlugins",
        "params": [{ "wallet_plugin_calculator": {} }],
    });
    let value = handled_ok(gate.handle("https://dapp.example", &request).await);

    assert_eq!(value["wallet_plugin_calculator"]["name"], "calculator");
    assert_eq!(
        value["wallet_plugin_calculator"]["permissionName"],
        "wallet_plugin_calculator"
    );
}

// ================================================================
// Domain metadata
// ================================================================

#[tokio::test]
async fn send_domain_metadata_always_answers_true() {
    let (gate, _) = make_gate(TestAccounts::default());
    let origin = "https://dapp.example";

    let value = handled_ok(
        gate.handle(
            origin,
            &json!({
                "method": "wallet_sendDomainMetadata",
                "params": [{ "name": "My Dapp" }],
            }),
        )
        .await,
    );
    assert_eq!(value, json!(true));
    assert_eq!(gate.metadata_for(origin).await.unwrap().name, "My Dapp");

    // A malformed payload is discarded but still acknowledged.
    let value = handled_ok(
        gate.handle(
            origin,
            &json!({ "method": "wallet_sendDomainMetadata", "params": [5] }),
        )
        .await,
    );
    assert_eq!(value, json!(true));
    assert_eq!(gate.metadata_for(origin).await.unwrap().name, "My Dapp");
}

#[tokio::test]
async fn metadata_without_a_name_is_discarded() {
    let (gate, _) = make_gate(TestAccounts::default());
    let origin = "https://dapp.example";

    let value = handled_ok(
        gate.handle(
            origin,
            &json!({ "method": "wallet_sendDomainMetadata", "params": [{}] }),
        )
        .await,
    );
    assert_eq!(value, json!(true));
    assert!(gate.metadata_for(origin).await.is_none());

    // A non-string name is no better.
    let value = handled_ok(
        gate.handle(
            origin,
            &json!({ "method": "wallet_sendDomainMetadata", "params": [{ "name": 5 }] }),
        )
        .await,
    );
    assert_eq!(value, json!(true));
    assert!(gate.metadata_for(origin).await.is_none());
}

#[tokio::test]
async fn extension_id_survives_metadata_updates() {
    let (gate, _) = make_gate(TestAccounts::default());
    let origin = "https://dapp.example";

    gate.handle(
        origin,
        &json!({
            "method": "wallet_sendDomainMetadata",
            "params": [{ "name": "A", "extensionId": "ext-1" }],
        }),
    )
    .await;
    gate.handle(
        origin,
        &json!({
            "method": "wallet_sendDomainMetadata",
            "params": [{ "name": "B" }],
        }),
    )
    .await;

    let metadata = gate.metadata_for(origin).await.unwrap();
    assert_eq!(metadata.name, "B");
    assert_eq!(metadata.extension_id, Some("ext-1".to_string()));
}

#[tokio::test]
async fn first_contact_records_the_hostname() {
    let (gate, _) = make_gate(TestAccounts::default());

    gate.handle(
        "https://dapp.example/page",
        &json!({ "method": "eth_chainId" }),
    )
    .await;
    assert_eq!(
        gate.metadata_for("https://dapp.example/page").await.unwrap().name,
        "dapp.example"
    );

    gate.handle("not a url", &json!({ "method": "eth_chainId" })).await;
    assert_eq!(
        gate.metadata_for("not a url").await.unwrap().name,
        UNKNOWN_DOMAIN
    );
}

#[tokio::test]
async fn gated_methods_do_not_record_first_contact() {
    let (gate, _) = make_gate(TestAccounts::default());
    let origin = "https://fresh.example";

    gate.handle(origin, &json!({ "method": "eth_accounts" })).await;
    gate.handle(origin, &json!({ "method": 5 })).await;
    assert!(gate.metadata_for(origin).await.is_none());

    // Forwarding is what records the origin.
    gate.handle(origin, &json!({ "method": "eth_chainId" })).await;
    assert_eq!(gate.metadata_for(origin).await.unwrap().name, "fresh.example");
}

#[tokio::test]
async fn internal_origin_is_never_recorded() {
    let (gate, _) = make_gate(TestAccounts::default());
    gate.handle(INTERNAL_ORIGIN, &json!({ "method": "eth_chainId" }))
        .await;
    assert!(gate.metadata_for(INTERNAL_ORIGIN).await.is_none());
}
