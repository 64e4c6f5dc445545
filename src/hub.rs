//! Hub: drives startup, reload, config changes and shutdown.
//!
//! The hub owns the registry, the loader factory and the mount table, and
//! threads them explicitly through every operation. Each server loads in its
//! own task; each load attempt runs in a further task so that a panicking
//! loader becomes an ordinary failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use axum::Router;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_servers, Backoff, ServerConfig};
use crate::entry::{ServerEntry, ServerStatus};
use crate::error::HubError;
use crate::factory::LoaderFactory;
use crate::loader::{CleanupAction, LoadError, LoadResult, Loader};
use crate::mount::{fallback_app, MountTable};
use crate::registry::{run_health_reconciliation, Registry};

/// Maximum delay between load attempts under exponential backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Extra time a load attempt gets beyond its readiness timeout before the
/// hub abandons it.
const ATTEMPT_GRACE: Duration = Duration::from_secs(10);

/// Outcome of [`Hub::startup`] (and the load half of [`Hub::apply_config`]).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub healthy: Vec<String>,
    /// Failed ids and their last error.
    pub failed: BTreeMap<String, String>,
    pub disabled: Vec<String>,
}

impl StartupReport {
    fn record(&mut self, id: String, outcome: crate::Result<ServerStatus>, error: Option<String>) {
        match outcome {
            Ok(ServerStatus::Healthy) => self.healthy.push(id),
            Ok(ServerStatus::Disabled) => self.disabled.push(id),
            Ok(status) => {
                self.failed
                    .insert(id, error.unwrap_or_else(|| format!("ended in status {}", status)));
            }
            Err(e) => {
                self.failed.insert(id, e.to_string());
            }
        }
    }

    fn sort(&mut self) {
        self.healthy.sort();
        self.disabled.sort();
    }
}

/// Outcome of [`Hub::apply_config`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reloaded: Vec<String>,
    pub unchanged: Vec<String>,
    pub loads: StartupReport,
}

/// Outcome of [`Hub::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Ids whose cleanup completed.
    pub cleaned: Vec<String>,
    /// Ids whose cleanup failed or panicked, with the reason.
    pub failures: BTreeMap<String, String>,
}

struct HubInner {
    registry: Arc<Registry>,
    factory: Arc<LoaderFactory>,
    mounts: Arc<MountTable>,
    configs: RwLock<HashMap<String, ServerConfig>>,
    tasks: std::sync::Mutex<JoinSet<()>>,
    cancel: CancellationToken,
    /// Serializes load sequences per server id.
    load_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Cheaply cloneable handle to the hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(LoaderFactory::with_defaults())
    }
}

impl Hub {
    pub fn new(factory: Arc<LoaderFactory>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Arc::new(Registry::new()),
                factory,
                mounts: Arc::new(MountTable::new()),
                configs: RwLock::new(HashMap::new()),
                tasks: std::sync::Mutex::new(JoinSet::new()),
                cancel: CancellationToken::new(),
                load_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn factory(&self) -> &Arc<LoaderFactory> {
        &self.inner.factory
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.inner.mounts
    }

    /// Token cancelled when the hub shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Router dispatching requests to mounted servers by path prefix.
    pub fn router(&self) -> Router {
        self.inner.mounts.router()
    }

    /// Configs currently held, sorted by id.
    pub async fn configs(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> =
            self.inner.configs.read().await.values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    fn ensure_running(&self) -> crate::Result<()> {
        if self.is_shutting_down() {
            Err(HubError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn load_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner
            .load_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Register and load every configured server.
    ///
    /// The whole list is validated first; on error nothing is registered.
    /// Enabled servers load concurrently. Individual load failures do not
    /// fail startup: they end in `Failed` with a fallback mounted.
    pub async fn startup(&self, configs: &[ServerConfig]) -> crate::Result<StartupReport> {
        self.ensure_running()?;
        validate_servers(configs)?;
        for config in configs {
            if self.inner.registry.contains(&config.id).await {
                return Err(HubError::DuplicateId(config.id.clone()));
            }
            let mount = config.mount_path();
            if self.inner.mounts.is_mounted(&mount).await {
                return Err(HubError::DuplicateMountPath(mount));
            }
        }

        tracing::info!(servers = configs.len(), "hub starting");
        let report = self.launch(configs.to_vec()).await?;
        tracing::info!(
            healthy = report.healthy.len(),
            failed = report.failed.len(),
            disabled = report.disabled.len(),
            "hub startup complete"
        );
        Ok(report)
    }

    /// Register entries, mount placeholders, then load enabled servers
    /// concurrently and wait for all of them.
    async fn launch(&self, configs: Vec<ServerConfig>) -> crate::Result<StartupReport> {
        let mut report = StartupReport::default();
        let mut loads = JoinSet::new();

        for config in configs {
            let mount = config.mount_path();
            let (status, message) = if config.enabled {
                ("loading", "server is loading")
            } else {
                ("disabled", "server is disabled")
            };
            let placeholder = fallback_app(&config.id, config.display_name(), message, status);

            let mut entry = ServerEntry::from_config(&config);
            entry.app = Some(placeholder.clone());
            self.inner.registry.register(entry).await?;
            self.inner
                .configs
                .write()
                .await
                .insert(config.id.clone(), config.clone());
            self.inner.mounts.mount(&mount, placeholder).await;

            if !config.enabled {
                tracing::info!(server = %config.id, "server disabled, skipping load");
                report.disabled.push(config.id);
                continue;
            }

            let hub = self.clone();
            loads.spawn(async move {
                let id = config.id.clone();
                let outcome = hub.load_and_apply(config).await;
                (id, outcome)
            });
        }

        while let Some(joined) = loads.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    let error = self
                        .inner
                        .registry
                        .get(&id)
                        .await
                        .and_then(|entry| entry.error);
                    report.record(id, outcome, error);
                }
                Err(e) => tracing::error!(error = %e, "server load task failed"),
            }
        }
        report.sort();
        Ok(report)
    }

    /// Run one full load sequence for `config` and store its outcome.
    async fn load_and_apply(&self, config: ServerConfig) -> crate::Result<ServerStatus> {
        let lock = self.load_lock(&config.id);
        let _guard = lock.lock().await;
        self.ensure_running()?;

        let generation = self
            .inner
            .registry
            .modify(&config.id, |entry| entry.begin_loading())
            .await??;

        let (result, attempts) = self.load_with_retry(&config).await;
        self.apply_result(&config, generation, result, attempts).await
    }

    /// Load `config` with its retry budget. Returns the final result and the
    /// number of attempts made.
    ///
    /// Configuration errors stop retrying at once. Cleanups attached to a
    /// failed attempt run before the next attempt starts.
    pub async fn load_with_retry(&self, config: &ServerConfig) -> (LoadResult, u32) {
        let Some(loader) = self.inner.factory.get_loader(&config.kind) else {
            tracing::error!(server = %config.id, kind = %config.kind, "no loader for server type");
            return (
                LoadResult::failure(LoadError::configuration(
                    HubError::NoLoader(config.kind.clone()).to_string(),
                )),
                0,
            );
        };

        let attempts = config.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(server = %config.id, attempt, max_attempts = attempts, "loading server");

            let result = self.run_attempt(loader.clone(), config).await;
            let Some(error) = result.error().cloned() else {
                tracing::info!(server = %config.id, attempt, "server loaded");
                return (result, attempt);
            };

            tracing::warn!(
                server = %config.id,
                attempt,
                kind = %error.kind,
                error = %error,
                "load attempt failed"
            );
            if let Some(cleanup) = result.cleanup() {
                if let Err(e) = cleanup.run().await {
                    tracing::warn!(server = %config.id, error = %e, "failed-attempt cleanup failed");
                }
            }

            if !error.kind.is_retryable() {
                tracing::error!(server = %config.id, error = %error, "non-retryable load failure");
                return (result, attempt);
            }
            if attempt >= attempts {
                tracing::error!(server = %config.id, attempts, "load retries exhausted");
                return (result, attempt);
            }

            let delay = retry_delay(config, attempt);
            tracing::info!(
                server = %config.id,
                delay_ms = delay.as_millis() as u64,
                "backing off before retry"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.cancel.cancelled() => {
                    tracing::info!(server = %config.id, "cancelled during backoff sleep");
                    return (result, attempt);
                }
            }
        }
    }

    /// Run a single loader attempt in its own task, bounded by the
    /// readiness timeout plus a grace period.
    async fn run_attempt(&self, loader: Arc<dyn Loader>, config: &ServerConfig) -> LoadResult {
        let limit = config.readiness_timeout() + ATTEMPT_GRACE;
        let owned = config.clone();
        let mut task = tokio::spawn(async move { loader.load(&owned).await });

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!("loader panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "load task was cancelled".to_string()
                };
                LoadResult::failure(LoadError::unexpected(message))
            }
            Err(_elapsed) => {
                task.abort();
                LoadResult::failure(LoadError::unexpected(format!(
                    "load attempt did not finish within {}s",
                    limit.as_secs()
                )))
            }
        }
    }

    /// Store a load outcome in the registry and mount the matching handle.
    ///
    /// The cleanup the entry held before is run only after the new state and
    /// mount are in place. A result for a superseded or removed entry, or one
    /// arriving after shutdown began, is cleaned up and dropped.
    async fn apply_result(
        &self,
        config: &ServerConfig,
        generation: u64,
        result: LoadResult,
        attempts: u32,
    ) -> crate::Result<ServerStatus> {
        let id = config.id.as_str();
        let new_cleanup = result.cleanup().cloned();

        if self.is_shutting_down() {
            tracing::info!(server = %id, "discarding load finished during shutdown");
            discard(id, new_cleanup).await;
            return Err(HubError::ShuttingDown);
        }

        let (status, app, applied) = match result.into_parts() {
            Ok(parts) => {
                let app = parts.app.clone();
                let applied = self
                    .inner
                    .registry
                    .modify(id, |entry| {
                        if entry.generation != generation {
                            return Ok(None);
                        }
                        entry.mark_healthy(parts, attempts).map(Some)
                    })
                    .await
                    .and_then(|inner| inner);
                (ServerStatus::Healthy, app, applied)
            }
            Err(error) => {
                tracing::error!(server = %id, attempts, error = %error, "server failed to load");
                let fallback = fallback_app(id, config.display_name(), &error.message, "failed");
                let app = fallback.clone();
                let applied = self
                    .inner
                    .registry
                    .modify(id, |entry| {
                        if entry.generation != generation {
                            return Ok(None);
                        }
                        entry.mark_failed(error.message, attempts, fallback).map(Some)
                    })
                    .await
                    .and_then(|inner| inner);
                (ServerStatus::Failed, app, applied)
            }
        };

        let previous = match applied {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                tracing::warn!(server = %id, "discarding result of superseded load");
                discard(id, new_cleanup).await;
                return Ok(ServerStatus::Loading);
            }
            Err(e) => {
                discard(id, new_cleanup).await;
                return Err(e);
            }
        };

        self.inner.mounts.mount(&config.mount_path(), app).await;

        if let Some(previous) = previous {
            tracing::debug!(server = %id, "running superseded cleanup");
            if let Err(e) = previous.run().await {
                tracing::warn!(server = %id, error = %e, "superseded cleanup failed");
            }
        }
        Ok(status)
    }

    /// Reload one server with its stored config.
    ///
    /// The current handle keeps serving while the new load runs.
    pub async fn reload(&self, id: &str) -> crate::Result<ServerStatus> {
        self.ensure_running()?;
        let config = self
            .inner
            .configs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;
        tracing::info!(server = %id, "reloading server");
        self.load_and_apply(config).await
    }

    /// Bring the hub in line with a new server list.
    ///
    /// Removed ids are unmounted, unregistered and cleaned up. Changed ids
    /// are torn down the same way and then registered and loaded afresh, as
    /// are new ids. Unchanged ids are left alone.
    pub async fn apply_config(&self, configs: &[ServerConfig]) -> crate::Result<ApplyReport> {
        self.ensure_running()?;
        validate_servers(configs)?;

        let current = self.inner.configs.read().await.clone();
        let desired: HashMap<&str, &ServerConfig> =
            configs.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut report = ApplyReport::default();
        let mut to_launch = Vec::new();

        let mut current_ids: Vec<&String> = current.keys().collect();
        current_ids.sort();
        for id in current_ids {
            match desired.get(id.as_str()) {
                None => {
                    self.remove_logged(id).await;
                    report.removed.push(id.clone());
                }
                Some(new) if **new != current[id] => {
                    self.remove_logged(id).await;
                    to_launch.push((*new).clone());
                    report.reloaded.push(id.clone());
                }
                Some(_) => report.unchanged.push(id.clone()),
            }
        }
        for config in configs {
            if !current.contains_key(&config.id) {
                to_launch.push(config.clone());
                report.added.push(config.id.clone());
            }
        }
        report.added.sort();

        tracing::info!(
            added = report.added.len(),
            removed = report.removed.len(),
            reloaded = report.reloaded.len(),
            unchanged = report.unchanged.len(),
            "applying config"
        );
        report.loads = self.launch(to_launch).await?;
        Ok(report)
    }

    async fn remove_logged(&self, id: &str) {
        if let Err(e) = self.remove_server(id).await {
            tracing::warn!(server = %id, error = %e, "server removal incomplete");
        }
    }

    /// Unmount, unregister and clean up one server.
    ///
    /// Waits for an in-flight load of the same id to finish first. A failing
    /// cleanup is reported after the entry is already gone.
    pub async fn remove_server(&self, id: &str) -> crate::Result<()> {
        let lock = self.load_lock(id);
        let _guard = lock.lock().await;

        self.inner.configs.write().await.remove(id);
        let entry = self
            .inner
            .registry
            .unregister(id)
            .await
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;
        self.inner.mounts.unmount(&entry.mount_path).await;
        tracing::info!(server = %id, "server removed");

        match entry.cleanup {
            Some(cleanup) => cleanup.run().await,
            None => Ok(()),
        }
    }

    /// Spawn a background task tied to the hub's lifetime. Shutdown waits
    /// for it after cancelling the hub token.
    pub fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(task);
    }

    /// Wait until no load sequence holds its per-id lock.
    async fn wait_for_loads(&self) {
        let locks: Vec<Arc<Mutex<()>>> = self
            .inner
            .load_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for lock in locks {
            drop(lock.lock().await);
        }
    }

    /// Start periodic health reconciliation. A zero interval disables it.
    pub fn spawn_health_reconciliation(&self, interval: Duration) {
        if interval.is_zero() {
            tracing::info!("health reconciliation disabled");
            return;
        }
        self.spawn_task(run_health_reconciliation(
            self.inner.registry.clone(),
            interval,
            self.inner.cancel.child_token(),
        ));
    }

    /// Stop background work and run every cleanup action once.
    ///
    /// Cleanups run concurrently, each in its own task; a failure or panic in
    /// one is recorded and never prevents the others. Nothing is retried.
    /// Calling shutdown again returns an empty report.
    ///
    /// In-flight load sequences are waited for first; each of them sees the
    /// cancelled token and drops its result after running its cleanup.
    pub async fn shutdown(&self) -> ShutdownReport {
        tracing::info!("hub shutting down");
        self.inner.cancel.cancel();
        self.wait_for_loads().await;

        let cleanups = self.inner.registry.take_cleanups().await;
        let handles: Vec<(String, tokio::task::JoinHandle<crate::Result<()>>)> = cleanups
            .into_iter()
            .map(|(id, cleanup)| (id, tokio::spawn(async move { cleanup.run().await })))
            .collect();

        let mut report = ShutdownReport::default();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => report.cleaned.push(id),
                Ok(Err(e)) => {
                    tracing::warn!(server = %id, error = %e, "cleanup failed during shutdown");
                    report.failures.insert(id, e.to_string());
                }
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        format!("cleanup panicked: {}", panic_message(join_error.into_panic()))
                    } else {
                        "cleanup task was cancelled".to_string()
                    };
                    tracing::warn!(server = %id, error = %reason, "cleanup failed during shutdown");
                    report.failures.insert(id, reason);
                }
            }
        }

        let mut tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        tracing::info!(
            cleaned = report.cleaned.len(),
            failed = report.failures.len(),
            "hub shutdown complete"
        );
        report
    }
}

/// Run the cleanup of a load result that will never be stored.
async fn discard(id: &str, cleanup: Option<CleanupAction>) {
    if let Some(cleanup) = cleanup {
        if let Err(e) = cleanup.run().await {
            tracing::warn!(server = %id, error = %e, "cleanup of discarded load failed");
        }
    }
}

/// Delay before the attempt following `attempt` (1-based).
pub fn retry_delay(config: &ServerConfig, attempt: u32) -> Duration {
    let base = config.retry_delay();
    match config.retry_backoff {
        Backoff::Fixed => base,
        Backoff::Exponential => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            std::cmp::min(base.saturating_mul(factor), BACKOFF_MAX)
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
