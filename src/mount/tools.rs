//! HTTP surface over an MCP client session's tools.
//!
//! Routes:
//! - `GET /` server id and tool count
//! - `GET /tools` tool definitions discovered at load time
//! - `POST /tools/:name` call a tool with an optional JSON object body

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rmcp::model::{CallToolRequestParams, CallToolResult, JsonObject, Tool};
use rmcp::{Peer, RoleClient};

/// Client side of an MCP session that tools can be listed and called on.
#[async_trait]
pub trait ToolSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>, String>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, String>;
}

#[async_trait]
impl ToolSession for Peer<RoleClient> {
    async fn list_tools(&self) -> Result<Vec<Tool>, String> {
        self.list_all_tools().await.map_err(|e| e.to_string())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, String> {
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments,
            task: None,
            meta: None,
        };
        Peer::call_tool(self, params).await.map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
struct ToolsState {
    server_id: Arc<str>,
    session: Arc<dyn ToolSession>,
    tools: Arc<Vec<Tool>>,
}

/// Build the tool surface for `session`, advertising `tools`.
pub fn tools_app(server_id: &str, session: Arc<dyn ToolSession>, tools: Vec<Tool>) -> Router {
    let state = ToolsState {
        server_id: Arc::from(server_id),
        session,
        tools: Arc::new(tools),
    };
    Router::new()
        .route("/", get(describe))
        .route("/tools", get(list_tools))
        .route("/tools/:name", post(call_tool))
        .with_state(state)
}

async fn describe(State(state): State<ToolsState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "server": &*state.server_id,
        "tools": state.tools.len(),
    }))
}

async fn list_tools(State(state): State<ToolsState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tools": &*state.tools }))
}

async fn call_tool(
    State(state): State<ToolsState>,
    Path(name): Path<String>,
    body: Option<Json<JsonObject>>,
) -> Response {
    if !state.tools.iter().any(|t| t.name.as_ref() == name) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "unknown tool",
                "message": format!("server '{}' has no tool '{}'", state.server_id, name),
            })),
        )
            .into_response();
    }

    let arguments = body.map(|Json(args)| args);
    match state.session.call_tool(&name, arguments).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            tracing::warn!(server = %state.server_id, tool = %name, error = %e, "tool call failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": "tool call failed", "message": e })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rmcp::model::Content;
    use tower::ServiceExt;

    pub(crate) fn make_tool(name: &str) -> Tool {
        let schema = Arc::new(
            serde_json::json!({"type": "object", "properties": {}})
                .as_object()
                .unwrap()
                .clone(),
        );
        Tool {
            name: name.to_string().into(),
            title: None,
            description: Some(format!("{} tool", name).into()),
            input_schema: schema,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        }
    }

    /// Session that echoes the call back as text.
    pub(crate) struct EchoSession;

    #[async_trait]
    impl ToolSession for EchoSession {
        async fn list_tools(&self) -> Result<Vec<Tool>, String> {
            Ok(vec![make_tool("echo")])
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: Option<JsonObject>,
        ) -> Result<CallToolResult, String> {
            let args = serde_json::Value::Object(arguments.unwrap_or_default());
            Ok(CallToolResult::success(vec![Content::text(format!(
                "{}:{}",
                name, args
            ))]))
        }
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn app() -> Router {
        tools_app("echo-server", Arc::new(EchoSession), vec![make_tool("echo")])
    }

    #[tokio::test]
    async fn test_describe_and_list() {
        let (status, body) = send(app(), Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"], "echo-server");
        assert_eq!(body["tools"], 1);

        let (_, body) = send(app(), Request::get("/tools").body(Body::empty()).unwrap()).await;
        assert_eq!(body["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn test_call_known_tool() {
        let req = Request::post("/tools/echo")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"msg":"hi"}"#))
            .unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::OK);
        let text = body["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("echo:"));
        assert!(text.contains("hi"));
    }

    #[tokio::test]
    async fn test_call_unknown_tool_is_404() {
        let req = Request::post("/tools/nope").body(Body::empty()).unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown tool");
    }
}
