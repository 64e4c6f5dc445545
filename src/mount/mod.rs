//! Path-prefix routing surface for loaded servers.
//!
//! The hub mounts one axum `Router` per server mount path. [`MountTable::router`]
//! produces a single `Router` whose fallback dispatches each request to the
//! router with the longest matching prefix, with that prefix stripped.

pub mod fallback;
pub mod proxy;
pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::sync::RwLock;
use tower::ServiceExt;

pub use fallback::fallback_app;
pub use proxy::{proxy_app, ClientSlot, ProxyTarget};
pub use tools::{tools_app, ToolSession};

/// Request extension carrying the mount prefix a request was dispatched under.
#[derive(Debug, Clone)]
pub struct MountPrefix(pub String);

/// Table of mounted routers keyed by normalized mount path.
#[derive(Default)]
pub struct MountTable {
    routes: RwLock<HashMap<String, Router>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `app` at `path`, returning the router it replaced.
    pub async fn mount(&self, path: &str, app: Router) -> Option<Router> {
        tracing::debug!(mount = %path, "mounting app");
        self.routes.write().await.insert(path.to_string(), app)
    }

    pub async fn unmount(&self, path: &str) -> Option<Router> {
        tracing::debug!(mount = %path, "unmounting app");
        self.routes.write().await.remove(path)
    }

    pub async fn is_mounted(&self, path: &str) -> bool {
        self.routes.read().await.contains_key(path)
    }

    /// Sorted list of mounted paths.
    pub async fn mounted_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Find the router for a request path.
    ///
    /// Matches whole segments only: `/api` matches `/api` and `/api/x` but
    /// not `/apix`. Returns `(prefix, router, remaining path)`; the remaining
    /// path is `/` when the request targets the mount point itself.
    pub async fn resolve(&self, path: &str) -> Option<(String, Router, String)> {
        let routes = self.routes.read().await;
        routes
            .iter()
            .filter_map(|(prefix, app)| {
                let rest = path.strip_prefix(prefix.as_str())?;
                if rest.is_empty() {
                    Some((prefix, app, "/".to_string()))
                } else if rest.starts_with('/') {
                    Some((prefix, app, rest.to_string()))
                } else {
                    None
                }
            })
            .max_by_key(|(prefix, _, _)| prefix.len())
            .map(|(prefix, app, rest)| (prefix.clone(), app.clone(), rest))
    }

    /// Build a router dispatching every request through this table.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self.clone())
    }
}

async fn dispatch(State(table): State<Arc<MountTable>>, mut req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let Some((prefix, app, rest)) = table.resolve(&path).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not found",
                "message": format!("no server mounted at '{}'", path),
            })),
        )
            .into_response();
    };

    let target = match req.uri().query() {
        Some(query) => format!("{}?{}", rest, query),
        None => rest,
    };
    match target.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "bad request", "message": e.to_string() })),
            )
                .into_response();
        }
    }
    req.extensions_mut().insert(MountPrefix(prefix));

    app.oneshot(req).await.unwrap_or_else(|never| match never {})
}
