//! HTTP front for a running hub.
//!
//! Serves the hub's status routes under `/_hub` and dispatches everything
//! else to the mounted servers. Status routes are read-only apart from
//! per-server reload.

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::entry::ServerStatus;
use crate::error::HubError;
use crate::hub::Hub;
use crate::registry::ListFilter;

/// Query parameters accepted by `GET /_hub/servers`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<ServerStatus>,
    /// Comma-separated; matches servers carrying any of the tags.
    pub tags: Option<String>,
    #[serde(default)]
    pub healthy: bool,
}

impl From<ListQuery> for ListFilter {
    fn from(query: ListQuery) -> Self {
        ListFilter {
            status: query.status,
            tags_any: query
                .tags
                .map(|tags| {
                    tags.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            healthy_only: query.healthy,
        }
    }
}

/// Full application: status routes plus the mount dispatcher.
pub fn app(hub: Hub) -> Router {
    let status = Router::new()
        .route("/_hub/servers", get(list_servers))
        .route("/_hub/servers/:id", get(get_server))
        .route("/_hub/servers/:id/reload", post(reload_server))
        .route("/_hub/stats", get(stats))
        .with_state(hub.clone());
    status.merge(hub.router())
}

async fn list_servers(State(hub): State<Hub>, Query(query): Query<ListQuery>) -> Response {
    let filter = ListFilter::from(query);
    let servers: Vec<_> = hub
        .registry()
        .list(&filter)
        .await
        .iter()
        .map(|entry| entry.summary())
        .collect();
    Json(serde_json::json!({ "servers": servers })).into_response()
}

async fn get_server(State(hub): State<Hub>, Path(id): Path<String>) -> Response {
    match hub.registry().get(&id).await {
        Some(entry) => Json(entry.summary()).into_response(),
        None => error_response(&HubError::NotFound(id)),
    }
}

async fn reload_server(State(hub): State<Hub>, Path(id): Path<String>) -> Response {
    match hub.reload(&id).await {
        Ok(status) => Json(serde_json::json!({ "id": id, "status": status })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn stats(State(hub): State<Hub>) -> Response {
    let stats = hub.registry().statistics().await;
    let mounts = hub.mounts().mounted_paths().await;
    Json(serde_json::json!({
        "total": stats.total,
        "healthy": stats.healthy,
        "per_status": stats.per_status,
        "mounts": mounts,
        "loaders": hub.factory().kinds(),
    }))
    .into_response()
}

fn error_response(error: &HubError) -> Response {
    let status = match error {
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::InvalidTransition { .. } => StatusCode::CONFLICT,
        HubError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

/// Serve [`app`] on `addr` until `cancel` fires.
pub async fn serve(hub: Hub, addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HubError::Io(addr.to_string(), e.to_string()))?;
    let local = listener
        .local_addr()
        .map_err(|e| HubError::Io(addr.to_string(), e.to_string()))?;
    tracing::info!(addr = %local, "hub HTTP server listening");

    axum::serve(listener, app(hub))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| HubError::Io(local.to_string(), e.to_string()))?;

    tracing::info!("hub HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{scripted, scripted_hub};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn started_hub() -> Hub {
        let (hub, _) = scripted_hub();
        let mut tagged = scripted("search", serde_json::json!({}));
        tagged.tags = vec!["web".to_string()];
        hub.startup(&[
            tagged,
            scripted("files", serde_json::json!({})),
            scripted("broken", serde_json::json!({"fail_times": -1})),
        ])
        .await
        .unwrap();
        hub
    }

    #[tokio::test]
    async fn test_list_servers_with_filters() {
        let app = app(started_hub().await);

        let (status, body) = call(&app, get_req("/_hub/servers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers"].as_array().unwrap().len(), 3);

        let (_, body) = call(&app, get_req("/_hub/servers?status=failed")).await;
        let servers = body["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0]["id"], "broken");
        assert!(servers[0]["error"].as_str().unwrap().contains("broken failed"));

        let (_, body) = call(&app, get_req("/_hub/servers?tags=web,other")).await;
        assert_eq!(body["servers"][0]["id"], "search");

        let (_, body) = call(&app, get_req("/_hub/servers?healthy=true")).await;
        assert_eq!(body["servers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_server_and_missing() {
        let app = app(started_hub().await);

        let (status, body) = call(&app, get_req("/_hub/servers/files")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "scripted");
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["capabilities"]["tools"], 1);

        let (status, body) = call(&app, get_req("/_hub/servers/ghost")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_stats_route() {
        let app = app(started_hub().await);
        let (status, body) = call(&app, get_req("/_hub/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["healthy"], 2);
        assert_eq!(body["per_status"]["failed"], 1);
        assert_eq!(body["mounts"], serde_json::json!(["/broken", "/files", "/search"]));
    }

    #[tokio::test]
    async fn test_mounted_servers_reachable_through_app() {
        let app = app(started_hub().await);
        let (status, body) = call(&app, get_req("/files")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"], "files");

        let (status, body) = call(&app, get_req("/broken/anything")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["serverId"], "broken");

        let (status, _) = call(&app, get_req("/nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_route() {
        let app = app(started_hub().await);
        let req = Request::post("/_hub/servers/files/reload")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let req = Request::post("/_hub/servers/ghost/reload")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let (hub, _) = scripted_hub();
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let task = tokio::spawn(serve(hub, addr, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
