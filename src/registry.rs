//! Registry: the authoritative table of server entries.
//!
//! All state lives behind one `tokio::sync::RwLock`; every mutation happens
//! under the write lock, so readers only ever see whole entries. Reads hand
//! out snapshot clones.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::entry::{ServerEntry, ServerStatus};
use crate::error::HubError;
use crate::loader::CleanupAction;

/// Filter for [`Registry::list`]. The default matches every entry.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<ServerStatus>,
    /// Match entries carrying at least one of these tags. Empty matches all.
    pub tags_any: Vec<String>,
    pub healthy_only: bool,
}

impl ListFilter {
    fn matches(&self, entry: &ServerEntry) -> bool {
        if self.healthy_only && !entry.is_healthy() {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        self.tags_any.is_empty() || entry.tags.iter().any(|t| self.tags_any.contains(t))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub healthy: usize,
    pub per_status: BTreeMap<ServerStatus, usize>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, ServerEntry>,
    /// Ids in registration order.
    order: Vec<String>,
}

#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Fails with `DuplicateId` if the id is taken; the
    /// existing entry is left untouched.
    pub async fn register(&self, entry: ServerEntry) -> crate::Result<()> {
        let mut state = self.state.write().await;
        if state.entries.contains_key(&entry.id) {
            return Err(HubError::DuplicateId(entry.id));
        }
        tracing::debug!(server = %entry.id, status = %entry.status, "registering server");
        state.order.push(entry.id.clone());
        state.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Mutate an entry under the write lock and return the updated snapshot.
    pub async fn update<F>(&self, id: &str, mutator: F) -> crate::Result<ServerEntry>
    where
        F: FnOnce(&mut ServerEntry),
    {
        self.modify(id, |entry| {
            mutator(entry);
            entry.clone()
        })
        .await
    }

    /// Mutate an entry under the write lock and return whatever the closure
    /// produces.
    pub async fn modify<F, T>(&self, id: &str, f: F) -> crate::Result<T>
    where
        F: FnOnce(&mut ServerEntry) -> T,
    {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;
        Ok(f(entry))
    }

    /// Remove an entry. Its cleanup is not run; the caller owns it now.
    pub async fn unregister(&self, id: &str) -> Option<ServerEntry> {
        let mut state = self.state.write().await;
        let entry = state.entries.remove(id)?;
        state.order.retain(|existing| existing != id);
        tracing::debug!(server = %id, "unregistered server");
        Some(entry)
    }

    pub async fn get(&self, id: &str) -> Option<ServerEntry> {
        self.state.read().await.entries.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    /// Entries matching `filter`, in registration order.
    pub async fn list(&self, filter: &ListFilter) -> Vec<ServerEntry> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    /// Registered ids, in registration order.
    pub async fn ids(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn statistics(&self) -> RegistryStatistics {
        let state = self.state.read().await;
        let mut per_status = BTreeMap::new();
        for entry in state.entries.values() {
            *per_status.entry(entry.status).or_insert(0) += 1;
        }
        RegistryStatistics {
            total: state.entries.len(),
            healthy: per_status.get(&ServerStatus::Healthy).copied().unwrap_or(0),
            per_status,
        }
    }

    /// Take every entry's cleanup action, leaving none behind.
    pub async fn take_cleanups(&self) -> Vec<(String, CleanupAction)> {
        let mut state = self.state.write().await;
        let RegistryState { entries, order } = &mut *state;
        order
            .iter()
            .filter_map(|id| {
                let entry = entries.get_mut(id)?;
                entry.cleanup.take().map(|c| (id.clone(), c))
            })
            .collect()
    }

    /// Probe every `Healthy` or `Degraded` entry once.
    ///
    /// Probes run concurrently without holding the lock. A result is dropped
    /// if the entry was reloaded or removed while its probe was in flight.
    /// Returns the number of entries whose status changed.
    pub async fn reconcile_health(&self) -> usize {
        let targets: Vec<(String, u64, Arc<dyn crate::loader::Backend>)> = {
            let state = self.state.read().await;
            state
                .order
                .iter()
                .filter_map(|id| state.entries.get(id))
                .filter(|entry| entry.status.is_loaded())
                .filter_map(|entry| {
                    entry
                        .backend
                        .clone()
                        .map(|backend| (entry.id.clone(), entry.generation, backend))
                })
                .collect()
        };

        let outcomes = futures::future::join_all(targets.into_iter().map(
            |(id, generation, backend)| async move {
                let outcome = backend.health_check().await.map_err(|e| e.to_string());
                (id, generation, outcome)
            },
        ))
        .await;

        let mut changed = 0;
        let mut state = self.state.write().await;
        for (id, generation, outcome) in outcomes {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.generation != generation {
                tracing::debug!(server = %id, "discarding stale health result");
                continue;
            }
            let before = entry.status;
            if entry.apply_health(outcome) {
                changed += 1;
                match &entry.error {
                    Some(error) => tracing::warn!(
                        server = %id,
                        from = %before,
                        to = %entry.status,
                        error = %error,
                        "health check failed"
                    ),
                    None => tracing::info!(server = %id, from = %before, to = %entry.status, "server recovered"),
                }
            }
        }
        changed
    }
}

/// Run [`Registry::reconcile_health`] every `interval` until `cancel` fires.
pub async fn run_health_reconciliation(
    registry: Arc<Registry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(interval_secs = interval.as_secs(), "health reconciliation started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                registry.reconcile_health().await;
            }
            _ = cancel.cancelled() => {
                tracing::debug!("health reconciliation stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::loader::{Backend, LoadResult};
    use async_trait::async_trait;
    use axum::Router;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend whose health is flipped from the test.
    struct ToggleBackend {
        healthy: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl Backend for ToggleBackend {
        fn kind(&self) -> &str {
            "toggle"
        }

        async fn health_check(&self) -> crate::Result<()> {
            tokio::time::sleep(self.delay).await;
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(HubError::Unhealthy("toggle".to_string(), "probe failed".to_string()))
            }
        }
    }

    fn entry(id: &str) -> ServerEntry {
        ServerEntry::from_config(&ServerConfig::new(id, "mock"))
    }

    fn tagged(id: &str, tags: &[&str]) -> ServerEntry {
        let mut e = entry(id);
        e.tags = tags.iter().map(|t| t.to_string()).collect();
        e
    }

    async fn register_healthy(registry: &Registry, id: &str, backend: ToggleBackend) {
        registry.register(entry(id)).await.unwrap();
        registry
            .modify(id, |e| {
                e.begin_loading().unwrap();
                let parts = LoadResult::success(Arc::new(backend), Router::new())
                    .into_parts()
                    .unwrap();
                e.mark_healthy(parts, 1).unwrap();
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected_and_existing_untouched() {
        let registry = Registry::new();
        let mut first = entry("svc");
        first.description = "original".to_string();
        registry.register(first).await.unwrap();

        let mut second = entry("svc");
        second.description = "replacement".to_string();
        let err = registry.register(second).await.unwrap_err();
        assert!(matches!(err, HubError::DuplicateId(id) if id == "svc"));

        let stored = registry.get("svc").await.unwrap();
        assert_eq!(stored.description, "original");
        assert_eq!(registry.ids().await, vec!["svc"]);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let registry = Registry::new();
        let err = registry.update("ghost", |_| {}).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_update_returns_snapshot() {
        let registry = Registry::new();
        registry.register(entry("svc")).await.unwrap();
        let snapshot = registry
            .update("svc", |e| e.error = Some("x".to_string()))
            .await
            .unwrap();
        assert_eq!(snapshot.error.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_on_distinct_ids() {
        let registry = Arc::new(Registry::new());
        for i in 0..16 {
            registry.register(entry(&format!("s{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("s{}", i);
                for _ in 0..50 {
                    registry.update(&id, |e| e.attempts += 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for entry in registry.list(&ListFilter::default()).await {
            assert_eq!(entry.attempts, 50, "entry {}", entry.id);
        }
    }

    #[tokio::test]
    async fn test_concurrent_update_and_get_never_torn() {
        let registry = Arc::new(Registry::new());
        registry.register(entry("svc")).await.unwrap();

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    let value = format!("v{}", i);
                    registry
                        .update("svc", |e| {
                            e.name = value.clone();
                            e.description = value;
                        })
                        .await
                        .unwrap();
                }
            })
        };
        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = registry.get("svc").await.unwrap();
                    assert!(
                        snapshot.description.is_empty() || snapshot.name == snapshot.description,
                        "torn entry: {:?}",
                        snapshot
                    );
                    tokio::task::yield_now().await;
                }
            })
        };
        writer.await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_and_order() {
        let registry = Registry::new();
        registry.register(tagged("c", &["search"])).await.unwrap();
        registry.register(tagged("a", &["files"])).await.unwrap();
        registry.register(tagged("b", &["search", "web"])).await.unwrap();
        registry
            .update("a", |e| e.status = ServerStatus::Failed)
            .await
            .unwrap();

        let all: Vec<String> = registry
            .list(&ListFilter::default())
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(all, vec!["c", "a", "b"]);

        let search = registry
            .list(&ListFilter {
                tags_any: vec!["search".to_string()],
                ..Default::default()
            })
            .await;
        assert_eq!(search.len(), 2);

        let failed = registry
            .list(&ListFilter {
                status: Some(ServerStatus::Failed),
                ..Default::default()
            })
            .await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "a");

        let healthy = registry
            .list(&ListFilter {
                healthy_only: true,
                ..Default::default()
            })
            .await;
        assert!(healthy.is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let registry = Registry::new();
        registry.register(entry("a")).await.unwrap();
        let mut disabled = entry("b");
        disabled.status = ServerStatus::Disabled;
        registry.register(disabled).await.unwrap();
        register_healthy(
            &registry,
            "c",
            ToggleBackend {
                healthy: Arc::new(AtomicBool::new(true)),
                delay: Duration::ZERO,
            },
        )
        .await;

        let stats = registry.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.per_status[&ServerStatus::Loading], 1);
        assert_eq!(stats.per_status[&ServerStatus::Disabled], 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_without_cleanup() {
        let registry = Registry::new();
        registry.register(entry("svc")).await.unwrap();
        let removed = registry.unregister("svc").await.unwrap();
        assert_eq!(removed.id, "svc");
        assert!(registry.get("svc").await.is_none());
        assert!(registry.ids().await.is_empty());
        assert!(registry.unregister("svc").await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_health_degrades_and_recovers() {
        let registry = Registry::new();
        let healthy = Arc::new(AtomicBool::new(true));
        register_healthy(
            &registry,
            "svc",
            ToggleBackend {
                healthy: healthy.clone(),
                delay: Duration::ZERO,
            },
        )
        .await;
        registry.register(entry("loading")).await.unwrap();

        assert_eq!(registry.reconcile_health().await, 0);

        healthy.store(false, Ordering::SeqCst);
        assert_eq!(registry.reconcile_health().await, 1);
        let degraded = registry.get("svc").await.unwrap();
        assert_eq!(degraded.status, ServerStatus::Degraded);
        assert!(degraded.error.unwrap().contains("probe failed"));

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(registry.reconcile_health().await, 1);
        assert_eq!(registry.get("svc").await.unwrap().status, ServerStatus::Healthy);
        assert_eq!(registry.get("loading").await.unwrap().status, ServerStatus::Loading);
    }

    #[tokio::test]
    async fn test_reconcile_discards_result_after_reload() {
        let registry = Arc::new(Registry::new());
        register_healthy(
            &registry,
            "svc",
            ToggleBackend {
                healthy: Arc::new(AtomicBool::new(false)),
                delay: Duration::from_millis(200),
            },
        )
        .await;

        let probe = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.reconcile_health().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A reload starts while the probe is in flight
        registry
            .modify("svc", |e| e.begin_loading().unwrap())
            .await
            .unwrap();

        assert_eq!(probe.await.unwrap(), 0);
        assert_eq!(registry.get("svc").await.unwrap().status, ServerStatus::Loading);
    }

    #[tokio::test]
    async fn test_health_loop_stops_on_cancel() {
        let registry = Arc::new(Registry::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_health_reconciliation(
            registry,
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_take_cleanups_clears_entries() {
        let registry = Registry::new();
        registry.register(entry("a")).await.unwrap();
        registry.register(entry("b")).await.unwrap();
        registry
            .update("b", |e| {
                e.cleanup = Some(CleanupAction::new("b", || async { Ok(()) }))
            })
            .await
            .unwrap();

        let taken = registry.take_cleanups().await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, "b");
        assert!(registry.take_cleanups().await.is_empty());
    }
}
