//! mcp-hub: serve configured tool servers behind one HTTP endpoint.
//!
//! Two subcommands:
//! - `mcp-hub serve`: load every configured server, mount them, serve HTTP
//! - `mcp-hub check`: validate a config file without loading anything

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mcp_hub::{run_hot_reload, serve, Hub, HubConfig, LoaderFactory};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "hub.toml";

#[derive(Parser)]
#[command(
    name = "mcp-hub",
    version,
    about = "Load, mount and supervise MCP tool servers behind one endpoint"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load all configured servers and serve them over HTTP
    Serve {
        /// Path to hub.toml [default: ./hub.toml or ~/.config/mcp-hub/hub.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Validate a config file and print the servers it declares
    Check {
        /// Path to hub.toml [default: ./hub.toml or ~/.config/mcp-hub/hub.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port).await?;
        }
        Commands::Check { config } => {
            let config = resolve_config(config)?;
            run_check(&config).await?;
        }
    }

    Ok(())
}

/// Start the hub, serve until Ctrl-C, then shut every server down.
async fn run_serve(config_path: PathBuf, host: String, port: u16) -> Result<()> {
    let config = load_config(&config_path).await?;
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e))?;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down mcp-hub...");
        cancel_for_signal.cancel();
    });

    let hub = Hub::default();
    let report = hub
        .startup(&config.servers)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start hub: {}", e))?;
    for (id, error) in &report.failed {
        tracing::warn!(server = %id, error = %error, "server unavailable, serving fallback");
    }

    hub.spawn_health_reconciliation(Duration::from_secs(config.hub.health_interval_secs));
    if config.hub.watch {
        hub.spawn_task(run_hot_reload(
            config_path.clone(),
            hub.clone(),
            hub.cancel_token().child_token(),
        ));
    }

    tracing::info!("Status routes at http://{}/_hub/servers", addr);
    let served = serve(hub.clone(), addr, cancel).await;

    let shutdown = hub.shutdown().await;
    for (id, reason) in &shutdown.failures {
        tracing::warn!(server = %id, error = %reason, "cleanup failed");
    }

    served.map_err(|e| anyhow::anyhow!("mcp-hub HTTP server error: {}", e))
}

/// Parse and validate the config, then print what it declares.
async fn run_check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path).await?;
    let factory = LoaderFactory::with_defaults();

    let servers: Vec<serde_json::Value> = config
        .servers
        .iter()
        .map(|server| {
            serde_json::json!({
                "id": server.id,
                "type": server.kind,
                "mount_path": server.mount_path(),
                "enabled": server.enabled,
                "loader_available": factory.get_loader(&server.kind).is_some(),
            })
        })
        .collect();
    let summary = serde_json::json!({
        "config": config_path.display().to_string(),
        "servers": servers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let missing: Vec<&str> = config
        .servers
        .iter()
        .filter(|s| factory.get_loader(&s.kind).is_none())
        .map(|s| s.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow::anyhow!(
            "No loader for servers: {}",
            missing.join(", ")
        ));
    }
    Ok(())
}

/// Resolve config file path: explicit flag, then ./hub.toml, then
/// ~/.config/mcp-hub/hub.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("mcp-hub").join(CONFIG_FILE);
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No hub.toml found. Searched ./hub.toml and ~/.config/mcp-hub/hub.toml. \
         Use --config to specify a path."
    ))
}

/// Load, parse and validate a hub.toml config file.
async fn load_config(config_path: &Path) -> Result<HubConfig> {
    let config = HubConfig::from_file(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config file {:?}: {}", config_path, e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", config_path, e))?;
    Ok(config)
}
