//! Loader for servers run as local child processes.
//!
//! The child is launched from a package (`uvx`, `npx`, `pipx`) or a raw
//! command, then readiness is awaited over one of two transports:
//! - `stdio`: MCP handshake over the child's stdin/stdout
//! - `http`: poll `http://127.0.0.1:{port}{health_path}` for a 2xx
//!
//! Readiness races process exit. Either way a failure carries the exit status
//! and the tail of what the process printed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::{resolve_env_vars, ServerConfig};
use crate::error::HubError;
use crate::loader::process::{Pipes, ProcessHandle};
use crate::loader::remote::{discover_tools, McpBackend};
use crate::loader::{parse_settings, Backend, CleanupAction, LoadError, LoadResult, Loader};
use crate::mount::{proxy_app, tools_app, ClientSlot, ProxyTarget, ToolSession};

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failed handshake waits for the child to be reaped before the
/// failure is classified.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Uvx,
    Npx,
    Pipx,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessSettings {
    pub package: Option<String>,
    pub version: Option<String>,
    pub package_manager: Option<PackageManager>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub transport: TransportMode,
    pub port: Option<u16>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Program and arguments to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the launch command from settings. A package takes precedence over a
/// raw command; `uvx` is the default package manager.
pub fn build_launch_command(settings: &SubprocessSettings) -> Result<LaunchCommand, LoadError> {
    if let Some(package) = settings.package.as_deref().filter(|p| !p.is_empty()) {
        let manager = settings.package_manager.unwrap_or(PackageManager::Uvx);
        let version = settings.version.as_deref().filter(|v| !v.is_empty());
        let (program, mut args) = match manager {
            PackageManager::Uvx => (
                "uvx",
                vec![match version {
                    Some(v) => format!("{}=={}", package, v),
                    None => package.to_string(),
                }],
            ),
            PackageManager::Npx => (
                "npx",
                vec![
                    "-y".to_string(),
                    match version {
                        Some(v) => format!("{}@{}", package, v),
                        None => package.to_string(),
                    },
                ],
            ),
            PackageManager::Pipx => (
                "pipx",
                vec![
                    "run".to_string(),
                    match version {
                        Some(v) => format!("{}=={}", package, v),
                        None => package.to_string(),
                    },
                ],
            ),
        };
        args.extend(settings.args.iter().cloned());
        return Ok(LaunchCommand {
            program: program.to_string(),
            args,
        });
    }

    match settings.command.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(command) => Ok(LaunchCommand {
            program: command.to_string(),
            args: settings.args.clone(),
        }),
        None => Err(LoadError::configuration(
            "subprocess server needs either 'package' or 'command'",
        )),
    }
}

enum Probe {
    Mcp(McpBackend),
    Http { slot: ClientSlot, url: String },
}

/// Backend over a child process. Unhealthy once the process has exited or
/// its transport stops answering.
pub struct SubprocessBackend {
    id: String,
    process: Arc<ProcessHandle>,
    probe: Probe,
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn kind(&self) -> &str {
        "subprocess"
    }

    fn capabilities(&self) -> BTreeMap<String, u64> {
        match &self.probe {
            Probe::Mcp(mcp) => mcp.capabilities(),
            Probe::Http { .. } => BTreeMap::new(),
        }
    }

    async fn health_check(&self) -> crate::Result<()> {
        if let Some(status) = self.process.try_exit_status().await {
            return Err(HubError::Unhealthy(
                self.id.clone(),
                format!("process exited with {}", status),
            ));
        }
        match &self.probe {
            Probe::Mcp(mcp) => mcp.probe().await,
            Probe::Http { slot, url } => {
                let client = slot.get().ok_or_else(|| {
                    HubError::Unhealthy(self.id.clone(), "client closed".to_string())
                })?;
                match client.get(url).timeout(HTTP_PROBE_TIMEOUT).send().await {
                    Ok(resp) if resp.status().is_success() => Ok(()),
                    Ok(resp) => Err(HubError::Unhealthy(
                        self.id.clone(),
                        format!("health endpoint returned {}", resp.status()),
                    )),
                    Err(e) => Err(HubError::Unhealthy(self.id.clone(), e.to_string())),
                }
            }
        }
    }
}

/// Loads `subprocess` servers.
#[derive(Debug, Default)]
pub struct SubprocessLoader;

impl SubprocessLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Loader for SubprocessLoader {
    fn kind(&self) -> &str {
        "subprocess"
    }

    async fn load(&self, config: &ServerConfig) -> LoadResult {
        let settings: SubprocessSettings = match parse_settings(config) {
            Ok(s) => s,
            Err(e) => return LoadResult::failure(e),
        };
        let launch = match build_launch_command(&settings) {
            Ok(launch) => launch,
            Err(e) => return LoadResult::failure(e),
        };
        let port = match (settings.transport, settings.port) {
            (TransportMode::Http, None) => {
                return LoadResult::failure(LoadError::configuration(
                    "http transport requires 'port'",
                ));
            }
            (_, port) => port,
        };

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args);
        if !settings.env.is_empty() {
            cmd.envs(resolve_env_vars(&settings.env));
        }
        if let Some(port) = port {
            cmd.env("PORT", port.to_string());
        }
        if let Some(ref cwd) = settings.cwd {
            cmd.current_dir(cwd);
        }

        let pipes = match settings.transport {
            TransportMode::Stdio => Pipes::Mcp,
            TransportMode::Http => Pipes::Drain,
        };
        let command_line = launch.command_line();
        let (process, mcp_pipes) =
            match ProcessHandle::spawn(&config.id, command_line.clone(), cmd, pipes) {
                Ok(spawned) => spawned,
                Err(e) => return LoadResult::failure(spawn_error(&launch, e)),
            };

        let cleanup = process_cleanup(&config.id, process.clone());
        let timeout = config.readiness_timeout();

        let result = match (settings.transport, mcp_pipes, port) {
            (TransportMode::Stdio, Some(transport), _) => {
                start_stdio(config, &process, transport, timeout).await
            }
            (TransportMode::Http, _, Some(port)) => {
                start_http(config, &settings, &process, port, timeout).await
            }
            _ => Err(LoadError::unexpected("child process streams were not piped")),
        };

        match result {
            Ok(result) => result
                .with_cleanup(cleanup)
                .with_info("command", command_line)
                .with_info("pid", process.pid())
                .with_info("port", port),
            Err(e) => {
                if let Err(cleanup_err) = cleanup.run().await {
                    tracing::warn!(server = %config.id, error = %cleanup_err, "cleanup after failed start failed");
                }
                LoadResult::failure(e).with_cleanup(cleanup)
            }
        }
    }
}

fn spawn_error(launch: &LaunchCommand, e: std::io::Error) -> LoadError {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            LoadError::configuration(format!("cannot run '{}': {}", launch.program, e))
        }
        _ => LoadError::transient(format!("failed to spawn '{}': {}", launch.command_line(), e)),
    }
}

fn process_cleanup(id: &str, process: Arc<ProcessHandle>) -> CleanupAction {
    CleanupAction::new(format!("subprocess:{}", id), move || async move {
        process.terminate().await
    })
}

/// Failure for a process that exited before it became ready.
async fn exited_before_ready(process: &ProcessHandle, status: Option<ExitStatus>) -> LoadError {
    process.settle_output().await;
    let status = status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown status".to_string());
    LoadError::crash(format!(
        "process `{}` exited with {} before becoming ready\n{}",
        process.command_line(),
        status,
        output_section(&process.output().await)
    ))
}

/// Failure for a process that did not become ready in time.
async fn not_ready(process: &ProcessHandle, timeout: Duration, reason: &str) -> LoadError {
    if let Err(e) = process.terminate().await {
        tracing::warn!(server = %process.server_id(), error = %e, "failed to terminate unready process");
    }
    LoadError::transient(format!(
        "process `{}` not ready after {}s: {}\n{}",
        process.command_line(),
        timeout.as_secs(),
        reason,
        output_section(&process.output().await)
    ))
}

fn output_section(output: &str) -> String {
    if output.trim().is_empty() {
        "--- output ---\n(no output)".to_string()
    } else {
        format!("--- output ---\n{}", output)
    }
}

async fn start_stdio(
    config: &ServerConfig,
    process: &Arc<ProcessHandle>,
    transport: crate::loader::process::McpPipes,
    timeout: Duration,
) -> Result<LoadResult, LoadError> {
    let id = config.id.as_str();
    let session_cancel = process.cancel_token().child_token();

    let handshake = tokio::time::timeout(timeout, ().serve_with_ct(transport, session_cancel));
    let running = tokio::select! {
        outcome = handshake => match outcome {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => {
                // Stdout EOF can fail the handshake before the child is reaped
                if let Ok(Some(status)) = tokio::time::timeout(EXIT_GRACE, process.wait_exit()).await {
                    return Err(exited_before_ready(process, Some(status)).await);
                }
                return Err(not_ready(process, timeout, &format!("MCP handshake failed: {}", e)).await);
            }
            Err(_elapsed) => {
                return Err(not_ready(process, timeout, "MCP handshake timed out").await);
            }
        },
        status = process.wait_exit() => {
            return Err(exited_before_ready(process, status).await);
        }
    };

    let peer = running.peer().clone();
    tokio::spawn(async move {
        let _ = running.waiting().await;
    });

    let session: Arc<dyn ToolSession> = Arc::new(peer);
    let tools = discover_tools(session.as_ref(), timeout).await?;
    tracing::info!(server = %id, tool_count = tools.len(), "subprocess tools discovered");

    let backend = Arc::new(SubprocessBackend {
        id: id.to_string(),
        process: process.clone(),
        probe: Probe::Mcp(McpBackend::new(id, "subprocess", session.clone(), tools.len())),
    });
    let app = tools_app(id, session, tools);
    Ok(LoadResult::success(backend, app).with_info("transport", "stdio"))
}

async fn start_http(
    config: &ServerConfig,
    settings: &SubprocessSettings,
    process: &Arc<ProcessHandle>,
    port: u16,
    timeout: Duration,
) -> Result<LoadResult, LoadError> {
    let id = config.id.as_str();
    let base_url = format!("http://127.0.0.1:{}", port);
    let health_url = format!("{}{}", base_url, settings.health_path);
    let slot = ClientSlot::with_timeout(HTTP_PROBE_TIMEOUT)
        .map_err(|e| LoadError::unexpected(format!("failed to build HTTP client: {}", e)))?;
    let client = slot
        .get()
        .ok_or_else(|| LoadError::unexpected("HTTP client closed before use"))?;
    let interval = Duration::from_millis(settings.poll_interval_ms.max(10));

    tracing::info!(server = %id, url = %health_url, "waiting for process health endpoint");

    tokio::select! {
        outcome = tokio::time::timeout(timeout, wait_http_ready(&client, &health_url, interval)) => {
            if outcome.is_err() {
                return Err(not_ready(process, timeout, &format!("{} never returned 2xx", health_url)).await);
            }
        }
        status = process.wait_exit() => {
            return Err(exited_before_ready(process, status).await);
        }
    }

    let backend = Arc::new(SubprocessBackend {
        id: id.to_string(),
        process: process.clone(),
        probe: Probe::Http {
            slot: slot.clone(),
            url: health_url,
        },
    });
    let app = proxy_app(slot, ProxyTarget::new(base_url.clone()));
    Ok(LoadResult::success(backend, app)
        .with_info("transport", "http")
        .with_info("url", base_url))
}

/// Poll `url` until it answers 2xx.
pub(crate) async fn wait_http_ready(client: &reqwest::Client, url: &str, interval: Duration) {
    loop {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => tracing::debug!(url = %url, status = %resp.status(), "not ready yet"),
            Err(e) => tracing::debug!(url = %url, error = %e, "not ready yet"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadErrorKind;

    fn settings(value: serde_json::Value) -> SubprocessSettings {
        serde_json::from_value(value).unwrap()
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_launch_command_for_package_managers() {
        let uvx = build_launch_command(&settings(serde_json::json!({
            "package": "mcp-server-time", "version": "0.6.2"
        })))
        .unwrap();
        assert_eq!(uvx.command_line(), "uvx mcp-server-time==0.6.2");

        let npx = build_launch_command(&settings(serde_json::json!({
            "package": "@modelcontextprotocol/server-memory",
            "version": "1.0.0",
            "package_manager": "npx",
        })))
        .unwrap();
        assert_eq!(
            npx.command_line(),
            "npx -y @modelcontextprotocol/server-memory@1.0.0"
        );

        let pipx = build_launch_command(&settings(serde_json::json!({
            "package": "weather-mcp", "version": "2.1", "package_manager": "pipx",
            "args": ["--verbose"],
        })))
        .unwrap();
        assert_eq!(pipx.command_line(), "pipx run weather-mcp==2.1 --verbose");
    }

    #[test]
    fn test_launch_command_raw() {
        let raw = build_launch_command(&settings(serde_json::json!({
            "command": "node", "args": ["server.js"]
        })))
        .unwrap();
        assert_eq!(raw.program, "node");
        assert_eq!(raw.args, vec!["server.js"]);
    }

    #[test]
    fn test_launch_command_requires_package_or_command() {
        let err = build_launch_command(&settings(serde_json::json!({}))).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration() {
        let config = ServerConfig::new("ghost", "subprocess").with_settings(serde_json::json!({
            "command": "/this/command/does/not/exist-hub"
        }));
        let result = SubprocessLoader::new().load(&config).await;
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Configuration);
        assert!(result.cleanup().is_none());
    }

    #[tokio::test]
    async fn test_http_without_port_is_configuration() {
        let config = ServerConfig::new("noport", "subprocess").with_settings(serde_json::json!({
            "command": "true", "transport": "http"
        }));
        let result = SubprocessLoader::new().load(&config).await;
        assert_eq!(result.error().unwrap().kind, LoadErrorKind::Configuration);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_ready_reports_stderr() {
        let mut config = ServerConfig::new("broken", "subprocess").with_settings(serde_json::json!({
            "command": "sh",
            "args": ["-c", "echo \"missing dependency\" >&2; exit 1"],
            "transport": "http",
            "port": unused_port(),
        }));
        config.readiness_timeout_secs = 10;

        let result = SubprocessLoader::new().load(&config).await;
        assert!(!result.is_success());
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Crash);
        assert!(err.message.contains("missing dependency"), "{}", err.message);
        assert!(err.message.contains("exit status: 1"), "{}", err.message);

        // Failure cleanup already ran; running it again is harmless
        let cleanup = result.cleanup().unwrap();
        assert!(cleanup.has_run());
        cleanup.run().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_timeout_kills_process() {
        let mut config = ServerConfig::new("slow", "subprocess").with_settings(serde_json::json!({
            "command": "sh",
            "args": ["-c", "echo booting; sleep 30"],
            "transport": "http",
            "port": unused_port(),
            "poll_interval_ms": 50,
        }));
        config.readiness_timeout_secs = 1;

        let started = std::time::Instant::now();
        let result = SubprocessLoader::new().load(&config).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Transient);
        assert!(err.message.contains("not ready after 1s"), "{}", err.message);
        assert!(err.message.contains("booting"), "{}", err.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_exit_before_handshake_is_crash() {
        let config = ServerConfig::new("noisy", "subprocess").with_settings(serde_json::json!({
            "command": "sh",
            "args": ["-c", "echo 'not a protocol message'; exit 2"],
        }));
        let result = SubprocessLoader::new().load(&config).await;
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Crash, "{}", err.message);
        assert!(err.message.contains("exit status: 2"), "{}", err.message);
        assert!(err.message.contains("not a protocol message"), "{}", err.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_stderr_crash_classified_consistently() {
        let config = ServerConfig::new("needs-deps", "subprocess").with_settings(serde_json::json!({
            "command": "sh",
            "args": ["-c", "echo 'missing dependency' >&2; exit 1"],
        }));
        let loader = SubprocessLoader::new();
        for _ in 0..5 {
            let result = loader.load(&config).await;
            let err = result.error().unwrap();
            assert_eq!(err.kind, LoadErrorKind::Crash, "{}", err.message);
            assert!(err.message.contains("exit status: 1"), "{}", err.message);
            assert!(err.message.contains("missing dependency"), "{}", err.message);
        }
    }

    #[tokio::test]
    async fn test_wait_http_ready_returns_on_2xx() {
        let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let url = format!("http://{}/health", addr);
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_http_ready(&client, &url, Duration::from_millis(20)),
        )
        .await
        .unwrap();
    }
}
