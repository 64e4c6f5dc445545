//! Loader for MCP servers reachable over Streamable HTTP.
//!
//! No local process is involved: the loader opens a client session, performs
//! the MCP handshake, discovers tools and mounts the tool surface. Cleanup
//! cancels the session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::Tool;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::HubError;
use crate::loader::{parse_settings, Backend, CleanupAction, LoadError, LoadResult, Loader};
use crate::mount::{tools_app, ToolSession};

/// Upper bound on a single health probe against an MCP session.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RemoteSettings {
    url: String,
    #[serde(default = "default_transport")]
    transport: String,
}

fn default_transport() -> String {
    "streamable-http".to_string()
}

/// Backend over an MCP client session. Healthy while the session answers a
/// tool listing within [`PROBE_TIMEOUT`].
pub struct McpBackend {
    id: String,
    kind: String,
    session: Arc<dyn ToolSession>,
    tool_count: u64,
}

impl McpBackend {
    pub fn new(id: &str, kind: &str, session: Arc<dyn ToolSession>, tool_count: usize) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            session,
            tool_count: tool_count as u64,
        }
    }

    pub(crate) async fn probe(&self) -> crate::Result<()> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.session.list_tools()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(HubError::Unhealthy(self.id.clone(), e)),
            Err(_) => Err(HubError::Unhealthy(
                self.id.clone(),
                format!("tool listing timed out after {}s", PROBE_TIMEOUT.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl Backend for McpBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([("tools".to_string(), self.tool_count)])
    }

    async fn health_check(&self) -> crate::Result<()> {
        self.probe().await
    }
}

/// Cleanup that cancels an MCP session's token.
pub(crate) fn session_cleanup(label: String, cancel: CancellationToken) -> CleanupAction {
    CleanupAction::new(label, move || async move {
        cancel.cancel();
        Ok(())
    })
}

/// List tools on a freshly connected session, bounded by `timeout`.
pub(crate) async fn discover_tools(
    session: &dyn ToolSession,
    timeout: Duration,
) -> Result<Vec<Tool>, LoadError> {
    match tokio::time::timeout(timeout, session.list_tools()).await {
        Ok(Ok(tools)) => Ok(tools),
        Ok(Err(e)) => Err(LoadError::transient(format!("failed to list tools: {}", e))),
        Err(_) => Err(LoadError::transient(format!(
            "tool listing timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Loads `remote` servers.
#[derive(Debug, Default)]
pub struct RemoteLoader;

impl RemoteLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Loader for RemoteLoader {
    fn kind(&self) -> &str {
        "remote"
    }

    async fn load(&self, config: &ServerConfig) -> LoadResult {
        let settings: RemoteSettings = match parse_settings(config) {
            Ok(s) => s,
            Err(e) => return LoadResult::failure(e),
        };
        if settings.transport != "streamable-http" {
            return LoadResult::failure(LoadError::configuration(format!(
                "unsupported remote transport '{}' (expected 'streamable-http')",
                settings.transport
            )));
        }

        let id = config.id.as_str();
        let timeout = config.readiness_timeout();
        let cancel = CancellationToken::new();

        tracing::info!(server = %id, url = %settings.url, "connecting to remote MCP server");

        let transport = StreamableHttpClientTransport::from_uri(settings.url.as_str());
        let running = match tokio::time::timeout(timeout, ().serve_with_ct(transport, cancel.clone()))
            .await
        {
            Err(_elapsed) => {
                cancel.cancel();
                return LoadResult::failure(LoadError::transient(format!(
                    "MCP handshake with {} timed out after {}s",
                    settings.url,
                    timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                cancel.cancel();
                return LoadResult::failure(LoadError::transient(format!(
                    "MCP handshake with {} failed: {}",
                    settings.url, e
                )));
            }
            Ok(Ok(running)) => running,
        };

        let cleanup = session_cleanup(format!("remote:{}", id), cancel);
        let peer = running.peer().clone();
        // Dropping the running service would cancel the session
        tokio::spawn(async move {
            let _ = running.waiting().await;
        });

        let session: Arc<dyn ToolSession> = Arc::new(peer);
        let tools = match discover_tools(session.as_ref(), timeout).await {
            Ok(tools) => tools,
            Err(e) => return LoadResult::failure(e).with_cleanup(cleanup),
        };
        tracing::info!(server = %id, tool_count = tools.len(), "remote tools discovered");

        let backend = Arc::new(McpBackend::new(id, "remote", session.clone(), tools.len()));
        let app = tools_app(id, session, tools);
        LoadResult::success(backend, app)
            .with_cleanup(cleanup)
            .with_info("transport", "streamable-http")
            .with_info("url", settings.url)
    }
}
