//! Reverse proxy app forwarding mounted requests to an upstream base URL.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared HTTP client that can be closed by a cleanup action.
///
/// Once closed, requests through apps built on this slot answer 503 instead
/// of reaching the upstream.
#[derive(Clone)]
pub struct ClientSlot {
    client: Arc<RwLock<Option<reqwest::Client>>>,
}

impl ClientSlot {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(RwLock::new(Some(client))),
        }
    }

    /// Build a slot around a client with the given request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client))
    }

    pub fn get(&self) -> Option<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the client. Safe to call more than once.
    pub fn close(&self) {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.get().is_none()
    }
}

/// Where proxied requests go, plus headers injected into each of them.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub base_url: String,
    pub headers: HeaderMap,
}

impl ProxyTarget {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: HeaderMap::new(),
        }
    }

    /// Add an injected header. Invalid names or values are skipped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid proxy header"),
        }
        self
    }

    /// Upstream URL for a request path and optional query.
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.is_empty() || path_and_query == "/" {
            format!("{}/", self.base_url)
        } else if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }
}

#[derive(Clone)]
struct ProxyState {
    slot: ClientSlot,
    target: Arc<ProxyTarget>,
}

/// Router forwarding every method and sub-path to `target`.
pub fn proxy_app(slot: ClientSlot, target: ProxyTarget) -> Router {
    Router::new().fallback(forward).with_state(ProxyState {
        slot,
        target: Arc::new(target),
    })
}

fn proxy_error(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": "proxy error", "message": message })),
    )
        .into_response()
}

async fn forward(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    let Some(client) = state.slot.get() else {
        return proxy_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream client closed".to_string(),
        );
    };

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = state.target.url_for(&path_and_query);

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return proxy_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut headers = parts.headers;
    for name in [HOST, CONNECTION, TRANSFER_ENCODING] {
        headers.remove(name);
    }
    for (name, value) in state.target.headers.iter() {
        headers.insert(name.clone(), value.clone());
    }

    tracing::debug!(method = %parts.method, url = %url, "proxying request");

    let upstream = match client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "proxy request failed");
            return proxy_error(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    response_headers.remove(TRANSFER_ENCODING);
    response_headers.remove(CONNECTION);
    match upstream.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            response
        }
        Err(e) => proxy_error(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    #[test]
    fn test_url_for_joins_paths() {
        let target = ProxyTarget::new("http://api.local/v1/");
        assert_eq!(target.url_for("/"), "http://api.local/v1/");
        assert_eq!(target.url_for("/pets?limit=2"), "http://api.local/v1/pets?limit=2");
        assert_eq!(target.url_for("pets"), "http://api.local/v1/pets");
    }

    #[test]
    fn test_invalid_header_skipped() {
        let target = ProxyTarget::new("http://x")
            .with_header("Authorization", "Bearer abc")
            .with_header("bad header", "v");
        assert_eq!(target.headers.len(), 1);
        assert_eq!(target.headers["authorization"], "Bearer abc");
    }

    #[test]
    fn test_close_is_idempotent() {
        let slot = ClientSlot::new(reqwest::Client::new());
        assert!(!slot.is_closed());
        slot.close();
        slot.close();
        assert!(slot.is_closed());
    }

    #[tokio::test]
    async fn test_closed_slot_answers_503() {
        let slot = ClientSlot::new(reqwest::Client::new());
        slot.close();
        let app = proxy_app(slot, ProxyTarget::new("http://127.0.0.1:9"));
        let response = app
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_forwards_to_upstream_with_injected_header() {
        let upstream = Router::new().route(
            "/pets",
            get(|headers: HeaderMap| async move {
                headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("missing")
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let target = ProxyTarget::new(format!("http://{}", addr)).with_header("x-api-key", "k1");
        let app = proxy_app(ClientSlot::new(reqwest::Client::new()), target);
        let response = app
            .oneshot(Request::builder().uri("/pets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"k1");
    }
}
