//! Loader for HTTP APIs described by an OpenAPI document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{parse_env_ref, resolve_env_value, ServerConfig};
use crate::error::HubError;
use crate::loader::{parse_settings, Backend, CleanupAction, LoadError, LoadResult, Loader};
use crate::mount::{proxy_app, ClientSlot, ProxyTarget};

/// Timeout for requests proxied to the API.
const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

const HTTP_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

#[derive(Debug, Deserialize)]
struct OpenApiSettings {
    spec_url: String,
    base_url: Option<String>,
    /// `${VAR}` reference to a bearer token.
    bearer_token: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// One operation declared by the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub method: String,
    pub path: String,
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// List the operations under `paths`, in path order.
pub fn derive_operations(spec: &serde_json::Value) -> Result<Vec<Operation>, LoadError> {
    let paths = spec
        .get("paths")
        .and_then(|p| p.as_object())
        .ok_or_else(|| LoadError::configuration("OpenAPI document has no 'paths' object"))?;

    let mut operations = Vec::new();
    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        for method in HTTP_METHODS {
            if let Some(op) = item.get(method) {
                operations.push(Operation {
                    method: method.to_uppercase(),
                    path: path.clone(),
                    operation_id: op
                        .get("operationId")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    summary: op.get("summary").and_then(|v| v.as_str()).map(str::to_string),
                });
            }
        }
    }
    Ok(operations)
}

/// Pick the upstream base URL: explicit setting, then `servers[0].url`
/// (resolved against the document URL when relative), then the document
/// URL's origin.
pub fn select_base_url(
    configured: Option<&str>,
    spec: &serde_json::Value,
    spec_url: &Url,
) -> Result<String, LoadError> {
    if let Some(base) = configured.filter(|b| !b.is_empty()) {
        return Ok(base.trim_end_matches('/').to_string());
    }

    let declared = spec
        .get("servers")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .and_then(|s| s.get("url"))
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty());

    match declared {
        Some(url) => spec_url
            .join(url)
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .map_err(|e| LoadError::configuration(format!("invalid server url '{}': {}", url, e))),
        None => Ok(spec_url.origin().ascii_serialization()),
    }
}

/// Fetch and parse the document.
async fn fetch_spec(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
) -> Result<serde_json::Value, LoadError> {
    let response = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| LoadError::transient(format!("failed to fetch {}: {}", url, e)))?;

    let status = response.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LoadError::transient(format!("fetching {} returned {}", url, status)));
    }
    if !status.is_success() {
        return Err(LoadError::configuration(format!(
            "fetching {} returned {}",
            url, status
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| LoadError::transient(format!("failed to read {}: {}", url, e)))?;
    serde_json::from_str(&body)
        .map_err(|e| LoadError::configuration(format!("malformed OpenAPI document at {}: {}", url, e)))
}

pub struct OpenApiBackend {
    id: String,
    slot: ClientSlot,
    spec_url: Url,
    operations: u64,
    paths: u64,
}

#[async_trait]
impl Backend for OpenApiBackend {
    fn kind(&self) -> &str {
        "openapi"
    }

    fn capabilities(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("operations".to_string(), self.operations),
            ("paths".to_string(), self.paths),
        ])
    }

    async fn health_check(&self) -> crate::Result<()> {
        let client = self
            .slot
            .get()
            .ok_or_else(|| HubError::Unhealthy(self.id.clone(), "client closed".to_string()))?;
        match client.get(self.spec_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(HubError::Unhealthy(
                self.id.clone(),
                format!("spec endpoint returned {}", resp.status()),
            )),
            Err(e) => Err(HubError::Unhealthy(self.id.clone(), e.to_string())),
        }
    }
}

/// Loads `openapi` servers.
#[derive(Debug, Default)]
pub struct OpenApiLoader;

impl OpenApiLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Loader for OpenApiLoader {
    fn kind(&self) -> &str {
        "openapi"
    }

    async fn load(&self, config: &ServerConfig) -> LoadResult {
        let settings: OpenApiSettings = match parse_settings(config) {
            Ok(s) => s,
            Err(e) => return LoadResult::failure(e),
        };
        let spec_url = match Url::parse(&settings.spec_url) {
            Ok(url) => url,
            Err(e) => {
                return LoadResult::failure(LoadError::configuration(format!(
                    "invalid spec_url '{}': {}",
                    settings.spec_url, e
                )));
            }
        };
        let bearer = match settings.bearer_token.as_deref() {
            Some(raw) if parse_env_ref(raw).is_none() => {
                return LoadResult::failure(LoadError::configuration(
                    "bearer_token must be a ${VAR} reference",
                ));
            }
            Some(raw) => Some(resolve_env_value(raw)).filter(|t| !t.is_empty()),
            None => None,
        };

        let slot = match ClientSlot::with_timeout(PROXY_TIMEOUT) {
            Ok(slot) => slot,
            Err(e) => {
                return LoadResult::failure(LoadError::unexpected(format!(
                    "failed to build HTTP client: {}",
                    e
                )));
            }
        };
        let cleanup = {
            let slot = slot.clone();
            CleanupAction::new(format!("openapi:{}", config.id), move || async move {
                slot.close();
                Ok(())
            })
        };
        let Some(client) = slot.get() else {
            return LoadResult::failure(LoadError::unexpected("HTTP client closed before use"))
                .with_cleanup(cleanup);
        };

        tracing::info!(server = %config.id, url = %spec_url, "fetching OpenAPI document");

        let spec = match fetch_spec(&client, &spec_url, config.readiness_timeout()).await {
            Ok(spec) => spec,
            Err(e) => return LoadResult::failure(e).with_cleanup(cleanup),
        };
        let (operations, base_url) = match derive_operations(&spec).and_then(|ops| {
            select_base_url(settings.base_url.as_deref(), &spec, &spec_url).map(|b| (ops, b))
        }) {
            Ok(derived) => derived,
            Err(e) => return LoadResult::failure(e).with_cleanup(cleanup),
        };

        let path_count = operations
            .iter()
            .map(|op| op.path.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        tracing::info!(
            server = %config.id,
            operations = operations.len(),
            base_url = %base_url,
            "OpenAPI document loaded"
        );

        let mut target = ProxyTarget::new(base_url.clone());
        for (name, value) in &settings.headers {
            target = target.with_header(name, &resolve_env_value(value));
        }
        if let Some(token) = bearer {
            target = target.with_header("authorization", &format!("Bearer {}", token));
        }

        let backend = Arc::new(OpenApiBackend {
            id: config.id.clone(),
            slot: slot.clone(),
            spec_url: spec_url.clone(),
            operations: operations.len() as u64,
            paths: path_count as u64,
        });

        let spec = Arc::new(spec);
        let listed = Arc::new(operations);
        let app = Router::new()
            .route(
                "/openapi.json",
                get(move || {
                    let spec = spec.clone();
                    async move { Json((*spec).clone()) }
                }),
            )
            .route(
                "/operations",
                get(move || {
                    let listed = listed.clone();
                    async move { Json(serde_json::json!({ "operations": &*listed })) }
                }),
            )
            .fallback_service(proxy_app(slot, target));

        LoadResult::success(backend, app)
            .with_cleanup(cleanup)
            .with_info("spec_url", spec_url.as_str())
            .with_info("base_url", base_url)
    }
}
