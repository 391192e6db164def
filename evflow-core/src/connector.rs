//! Connector Dispatcher (C5, spec.md §4.5).
//!
//! Routes a `(connector_id, principal_id, action, slots)` call against a
//! registered integration, honouring the integration's own timeout, and
//! extracts typed output from the raw response. HTTP clients are pooled per
//! base URL (grounded on `CloudLLM-ai-cloudllm`'s `http_pool`/`http_client_pool`
//! modules, the pack's only precedent for pooling by base URL) so repeated
//! calls to the same integration reuse connections.

use crate::error::ConnectorError;
use crate::templates::{extract_output, resolve_slots};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrationKind {
    MessagePlatform,
    EmailTransport,
    GenericRest,
    GraphQl,
    SpecializedSaas,
}

#[derive(Clone, Debug)]
pub struct Integration {
    pub connector_id: String,
    pub kind: IntegrationKind,
    pub base_url: String,
    pub timeout_ms: u64,
}

/// Looks up registered integrations. Backed by an in-memory map here;
/// production deployments would source this from configuration.
pub trait IntegrationRegistry: Send + Sync {
    fn get(&self, connector_id: &str) -> Option<Integration>;
}

/// Resolves per-principal credentials for a connector. Kept async since a
/// real implementation decrypts secrets from a vault.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(
        &self,
        connector_id: &str,
        principal_id: &str,
    ) -> Result<BTreeMap<String, String>, ConnectorError>;
}

pub struct MemoryIntegrationRegistry {
    integrations: HashMap<String, Integration>,
}

impl MemoryIntegrationRegistry {
    pub fn new() -> Self {
        Self { integrations: HashMap::new() }
    }

    pub fn register(&mut self, integration: Integration) {
        self.integrations.insert(integration.connector_id.clone(), integration);
    }
}

impl Default for MemoryIntegrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationRegistry for MemoryIntegrationRegistry {
    fn get(&self, connector_id: &str) -> Option<Integration> {
        self.integrations.get(connector_id).cloned()
    }
}

pub struct MemoryCredentialProvider {
    credentials: HashMap<(String, String), BTreeMap<String, String>>,
}

impl MemoryCredentialProvider {
    pub fn new() -> Self {
        Self { credentials: HashMap::new() }
    }

    pub fn register(&mut self, connector_id: &str, principal_id: &str, headers: BTreeMap<String, String>) {
        self.credentials.insert((connector_id.to_string(), principal_id.to_string()), headers);
    }
}

impl Default for MemoryCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentialProvider {
    async fn credentials(
        &self,
        connector_id: &str,
        principal_id: &str,
    ) -> Result<BTreeMap<String, String>, ConnectorError> {
        self.credentials
            .get(&(connector_id.to_string(), principal_id.to_string()))
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownPrincipal(principal_id.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct ConnectorResult {
    pub success: bool,
    pub raw_response: Value,
    pub extracted: Map<String, Value>,
    pub duration_ms: u64,
}

static HTTP_CLIENT_POOL: Lazy<Mutex<HashMap<String, reqwest::Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn client_for(base_url: &str) -> reqwest::Client {
    let mut pool = HTTP_CLIENT_POOL.lock().unwrap();
    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }
    let client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .expect("failed to build connector HTTP client");
    pool.insert(base_url.to_string(), client.clone());
    client
}

/// Maps `<resource>.<verb>` action names to an HTTP method (spec.md §4.5).
/// Unrecognised verbs default to POST; no unknown-verb error is raised since
/// the action string is caller-declared and resource-specific verbs (e.g.
/// `record.upsert`) should still route somewhere sensible.
fn method_for_action(action: &str) -> Method {
    let verb = action.rsplit('.').next().unwrap_or(action);
    match verb {
        "create" | "send" | "trigger" | "post" => Method::POST,
        "fetch" | "get" | "list" | "read" | "score" => Method::GET,
        "update" | "patch" => Method::PATCH,
        "replace" => Method::PUT,
        "delete" | "remove" => Method::DELETE,
        other => {
            tracing::debug!(action, other, "connector: unrecognised verb, defaulting to POST");
            Method::POST
        }
    }
}

pub struct ConnectorDispatcher {
    registry: std::sync::Arc<dyn IntegrationRegistry>,
    credentials: std::sync::Arc<dyn CredentialProvider>,
}

impl ConnectorDispatcher {
    pub fn new(
        registry: std::sync::Arc<dyn IntegrationRegistry>,
        credentials: std::sync::Arc<dyn CredentialProvider>,
    ) -> Self {
        Self { registry, credentials }
    }

    pub async fn dispatch(
        &self,
        connector_id: &str,
        principal_id: &str,
        action: &str,
        slots: &BTreeMap<String, String>,
        extract: &BTreeMap<String, String>,
        scope: &Value,
    ) -> Result<ConnectorResult, ConnectorError> {
        let body = Value::Object(resolve_slots(slots, scope));
        self.dispatch_with_body(connector_id, principal_id, action, body, extract).await
    }

    /// Same as `dispatch`, but takes an already-built JSON body instead of
    /// resolving `slots` via dot-path against a scope. Used by callers that
    /// render full templates themselves (e.g. `send_email`'s
    /// to/subject/body templates) rather than pointing at scope paths.
    pub async fn dispatch_with_body(
        &self,
        connector_id: &str,
        principal_id: &str,
        action: &str,
        body: Value,
        extract: &BTreeMap<String, String>,
    ) -> Result<ConnectorResult, ConnectorError> {
        let integration =
            self.registry.get(connector_id).ok_or_else(|| ConnectorError::UnknownConnector(connector_id.to_string()))?;
        let headers = self.credentials.credentials(connector_id, principal_id).await?;

        let started = std::time::Instant::now();
        let client = client_for(&integration.base_url);
        let method = method_for_action(action);

        let request = match integration.kind {
            IntegrationKind::GraphQl => {
                let gql_body = serde_json::json!({ "query": action, "variables": body });
                client.post(&integration.base_url).json(&gql_body)
            }
            _ if method == Method::GET => client.request(method, &integration.base_url).query(&flatten_for_query(&body)),
            _ => client.request(method, &integration.base_url).json(&body),
        };

        let mut request = request.timeout(Duration::from_millis(integration.timeout_ms));
        for (k, v) in &headers {
            request = request.header(k, v);
        }

        let response = tokio::time::timeout(Duration::from_millis(integration.timeout_ms), request.send())
            .await
            .map_err(|_| ConnectorError::Timeout(integration.timeout_ms))?
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout(integration.timeout_ms)
                } else {
                    ConnectorError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let duration_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Upstream { status: status.as_u16(), body: body_text });
        }

        let raw_response: Value = response.json().await.unwrap_or(Value::Null);
        let extracted = extract_output(extract, &raw_response);

        Ok(ConnectorResult { success: true, raw_response, extracted, duration_ms })
    }
}

fn flatten_for_query(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), crate::templates::stringify(v))).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_for_action_maps_known_verbs() {
        assert_eq!(method_for_action("ticket.create"), Method::POST);
        assert_eq!(method_for_action("record.fetch"), Method::GET);
        assert_eq!(method_for_action("record.update"), Method::PATCH);
        assert_eq!(method_for_action("record.replace"), Method::PUT);
        assert_eq!(method_for_action("record.delete"), Method::DELETE);
        assert_eq!(method_for_action("ml.score"), Method::GET);
    }

    #[test]
    fn method_for_action_defaults_to_post_for_unknown_verb() {
        assert_eq!(method_for_action("record.upsert"), Method::POST);
    }

    #[tokio::test]
    async fn dispatch_unknown_connector_errors() {
        let registry = std::sync::Arc::new(MemoryIntegrationRegistry::new());
        let credentials = std::sync::Arc::new(MemoryCredentialProvider::new());
        let dispatcher = ConnectorDispatcher::new(registry, credentials);
        let err = dispatcher
            .dispatch("ghost", "p1", "record.fetch", &BTreeMap::new(), &BTreeMap::new(), &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownConnector(_)));
    }

    #[tokio::test]
    async fn dispatch_unknown_principal_errors() {
        let mut registry = MemoryIntegrationRegistry::new();
        registry.register(Integration {
            connector_id: "crm".to_string(),
            kind: IntegrationKind::GenericRest,
            base_url: "https://example.invalid/crm".to_string(),
            timeout_ms: 1000,
        });
        let dispatcher =
            ConnectorDispatcher::new(std::sync::Arc::new(registry), std::sync::Arc::new(MemoryCredentialProvider::new()));
        let err = dispatcher
            .dispatch("crm", "ghost_principal", "record.fetch", &BTreeMap::new(), &BTreeMap::new(), &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnknownPrincipal(_)));
    }
}
