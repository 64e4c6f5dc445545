//! Hot-reload for `mcp-hub serve`.
//!
//! Watches the hub config file with `notify`. After each change (100ms
//! debounce) the file is re-parsed and validated, then handed to
//! [`Hub::apply_config`], which reloads only the servers that changed.
//! A config that fails to read or validate leaves the running state alone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify::Watcher;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::hub::{ApplyReport, Hub};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watch `config_path` and apply each change to `hub` until `cancel` fires.
pub async fn run_hot_reload(config_path: PathBuf, hub: Hub, cancel: CancellationToken) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify's EventHandler is implemented for FnMut, not for tokio senders
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create file watcher for hot-reload");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %config_path.display(),
            error = %e,
            "failed to watch config file for hot-reload"
        );
        return;
    }

    // Dropping the watcher stops events silently
    let _watcher = watcher;

    tracing::info!(path = %config_path.display(), "hot-reload watching config file");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        match reload_config(&config_path, &hub).await {
                            Ok(report) => tracing::info!(
                                path = %config_path.display(),
                                added = report.added.len(),
                                removed = report.removed.len(),
                                reloaded = report.reloaded.len(),
                                failed = report.loads.failed.len(),
                                "config reloaded"
                            ),
                            Err(e) => tracing::warn!(
                                error = %e,
                                path = %config_path.display(),
                                "hot-reload failed, keeping previous config"
                            ),
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watcher error during hot-reload");
                    }
                    None => {
                        tracing::debug!("hot-reload watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("hot-reload cancelled");
                return;
            }
        }
    }
}

/// Read, validate and apply the config at `config_path`.
pub async fn reload_config(config_path: &Path, hub: &Hub) -> crate::Result<ApplyReport> {
    let config = HubConfig::from_file(config_path).await?;
    config.validate()?;
    hub.apply_config(&config.servers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ServerStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MODULE_SERVER: &str = r#"
[[servers]]
id = "echo"
type = "module"
retry_attempts = 1
settings = { module = "echo" }
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut temp = NamedTempFile::new().expect("create temp file");
        write!(temp, "{}", contents).expect("write to temp file");
        temp
    }

    #[tokio::test]
    async fn test_reload_config_empty_file() {
        let temp = write_config("# no servers\n");
        let hub = Hub::default();
        let report = reload_config(temp.path(), &hub).await.unwrap();
        assert!(report.added.is_empty());
        assert!(report.removed.is_empty());
    }

    #[tokio::test]
    async fn test_reload_config_adds_then_removes() {
        let hub = Hub::default();
        let temp = write_config(MODULE_SERVER);
        let report = reload_config(temp.path(), &hub).await.unwrap();
        assert_eq!(report.added, vec!["echo"]);
        assert_eq!(
            hub.registry().get("echo").await.unwrap().status,
            ServerStatus::Healthy
        );

        let emptied = write_config("");
        let report = reload_config(emptied.path(), &hub).await.unwrap();
        assert_eq!(report.removed, vec!["echo"]);
        assert!(hub.registry().get("echo").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_config_invalid_toml_keeps_state() {
        let hub = Hub::default();
        let good = write_config(MODULE_SERVER);
        reload_config(good.path(), &hub).await.unwrap();

        let bad = write_config("this is not valid toml {{{{");
        assert!(reload_config(bad.path(), &hub).await.is_err());
        assert!(hub.registry().contains("echo").await);
    }

    #[tokio::test]
    async fn test_reload_config_duplicate_ids_rejected() {
        let hub = Hub::default();
        let temp = write_config(&format!("{}{}", MODULE_SERVER, MODULE_SERVER));
        let err = reload_config(temp.path(), &hub).await.unwrap_err();
        assert!(err.to_string().contains("duplicate server id"));
        assert!(hub.registry().ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_config_missing_file() {
        let hub = Hub::default();
        let path = PathBuf::from("/nonexistent/path/hub.toml");
        assert!(reload_config(&path, &hub).await.is_err());
    }

    #[tokio::test]
    async fn test_watcher_applies_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "").unwrap();

        let hub = Hub::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_hot_reload(path.clone(), hub.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, MODULE_SERVER).unwrap();
        let mut loaded = false;
        for _ in 0..50 {
            if hub.registry().contains("echo").await {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(loaded, "config change was not applied");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
