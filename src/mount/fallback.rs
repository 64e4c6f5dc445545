//! Responder mounted in place of a server that is not serving.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};

/// Build a router that answers every method and sub-path with 503 and a
/// structured payload:
///
/// `{"error":"service unavailable","serverId","serverName","message","status"}`
///
/// `status` is the entry status that caused the fallback (`failed`,
/// `disabled` or `loading`).
pub fn fallback_app(server_id: &str, server_name: &str, message: &str, status: &str) -> Router {
    let payload = Arc::new(serde_json::json!({
        "error": "service unavailable",
        "serverId": server_id,
        "serverName": server_name,
        "message": message,
        "status": status,
    }));

    Router::new().fallback(move || {
        let payload = payload.clone();
        async move { (StatusCode::SERVICE_UNAVAILABLE, Json((*payload).clone())) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn call(app: Router, method: Method, path: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_fallback_payload_at_root() {
        let app = fallback_app("bad", "Bad Server", "connection refused", "failed");
        let (status, body) = call(app, Method::GET, "/").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "service unavailable");
        assert_eq!(body["serverId"], "bad");
        assert_eq!(body["serverName"], "Bad Server");
        assert_eq!(body["message"], "connection refused");
        assert_eq!(body["status"], "failed");
    }

    #[tokio::test]
    async fn test_fallback_answers_any_method_and_path() {
        let app = fallback_app("bad", "bad", "boom", "failed");
        let (status, body) = call(app, Method::POST, "/tools/deep/path?x=1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["serverId"], "bad");
    }
}
