//! Loader grouping several member servers under one mount path.
//!
//! Members are loaded concurrently through the loader factory. The composite
//! succeeds only if every enabled member does; otherwise every member that
//! acquired resources is cleaned up.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::{validate_servers, ServerConfig};
use crate::error::HubError;
use crate::factory::LoaderFactory;
use crate::loader::{
    parse_settings, Backend, CleanupAction, LoadError, LoadErrorKind, LoadResult, Loader,
};

#[derive(Debug, Deserialize)]
struct CompositeSettings {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

pub struct CompositeBackend {
    id: String,
    members: Vec<(String, Arc<dyn Backend>)>,
}

#[async_trait]
impl Backend for CompositeBackend {
    fn kind(&self) -> &str {
        "composite"
    }

    /// Member capabilities summed per class, plus a `members` count.
    fn capabilities(&self) -> BTreeMap<String, u64> {
        let mut total = BTreeMap::new();
        for (_, member) in &self.members {
            for (name, count) in member.capabilities() {
                *total.entry(name).or_insert(0) += count;
            }
        }
        total.insert("members".to_string(), self.members.len() as u64);
        total
    }

    async fn health_check(&self) -> crate::Result<()> {
        for (member_id, member) in &self.members {
            if let Err(e) = member.health_check().await {
                return Err(HubError::Unhealthy(
                    self.id.clone(),
                    format!("member '{}': {}", member_id, e),
                ));
            }
        }
        Ok(())
    }
}

/// Loads `composite` servers.
pub struct CompositeLoader {
    factory: Weak<LoaderFactory>,
}

impl CompositeLoader {
    pub fn new(factory: Weak<LoaderFactory>) -> Self {
        Self { factory }
    }
}

async fn load_member(factory: &LoaderFactory, member: &ServerConfig) -> LoadResult {
    match factory.get_loader(&member.kind) {
        Some(loader) => loader.load(member).await,
        None => LoadResult::failure(LoadError::configuration(
            HubError::NoLoader(member.kind.clone()).to_string(),
        )),
    }
}

#[async_trait]
impl Loader for CompositeLoader {
    fn kind(&self) -> &str {
        "composite"
    }

    async fn load(&self, config: &ServerConfig) -> LoadResult {
        let settings: CompositeSettings = match parse_settings(config) {
            Ok(s) => s,
            Err(e) => return LoadResult::failure(e),
        };
        let members: Vec<ServerConfig> = settings
            .servers
            .into_iter()
            .filter(|m| m.enabled)
            .collect();
        if members.is_empty() {
            return LoadResult::failure(LoadError::configuration(
                "composite server needs at least one enabled member",
            ));
        }
        if let Err(e) = validate_servers(&members) {
            return LoadResult::failure(LoadError::configuration(e.to_string()));
        }
        let Some(factory) = self.factory.upgrade() else {
            return LoadResult::failure(LoadError::unexpected("loader factory was dropped"));
        };

        tracing::info!(server = %config.id, members = members.len(), "loading composite members");

        let results =
            futures::future::join_all(members.iter().map(|m| load_member(&factory, m))).await;

        let cleanup = CleanupAction::combine(
            format!("composite:{}", config.id),
            results.iter().filter_map(|r| r.cleanup().cloned()).collect(),
        );

        let failures: Vec<(&ServerConfig, &LoadError)> = members
            .iter()
            .zip(&results)
            .filter_map(|(m, r)| r.error().map(|e| (m, e)))
            .collect();
        if !failures.is_empty() {
            let kind = failures
                .iter()
                .map(|(_, e)| e.kind)
                .find(|k| k.is_retryable())
                .unwrap_or(LoadErrorKind::Configuration);
            let message = failures
                .iter()
                .map(|(m, e)| format!("member '{}': {}", m.id, e))
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(server = %config.id, failed = failures.len(), "composite member load failed");
            if let Err(e) = cleanup.run().await {
                tracing::warn!(server = %config.id, error = %e, "composite cleanup failed");
            }
            return LoadResult::failure(LoadError::new(kind, message)).with_cleanup(cleanup);
        }

        let listing: Vec<serde_json::Value> = members
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "name": m.display_name(),
                    "type": m.kind,
                    "mount_path": m.mount_path(),
                })
            })
            .collect();

        let mut app = Router::new();
        let mut backends = Vec::with_capacity(members.len());
        for (member, result) in members.iter().zip(results) {
            match result.into_parts() {
                Ok(parts) => {
                    app = app.nest(&member.mount_path(), parts.app);
                    backends.push((member.id.clone(), parts.server));
                }
                Err(e) => {
                    if let Err(cleanup_err) = cleanup.run().await {
                        tracing::warn!(server = %config.id, error = %cleanup_err, "composite cleanup failed");
                    }
                    return LoadResult::failure(e).with_cleanup(cleanup);
                }
            }
        }

        let listing = Arc::new(listing);
        let app = app.route(
            "/",
            get(move || {
                let listing = listing.clone();
                async move { Json(serde_json::json!({ "members": &*listing })) }
            }),
        );

        let member_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        let backend = Arc::new(CompositeBackend {
            id: config.id.clone(),
            members: backends,
        });
        LoadResult::success(backend, app)
            .with_cleanup(cleanup)
            .with_info("members", member_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Succeeds unless settings carry `"fail": true`; counts cleanup runs.
    struct CountingLoader {
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for CountingLoader {
        fn kind(&self) -> &str {
            "counting"
        }

        async fn load(&self, config: &ServerConfig) -> LoadResult {
            let counter = self.cleanups.clone();
            let cleanup = CleanupAction::new(config.id.clone(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            if config.settings.get("fail").is_some() {
                return LoadResult::failure(LoadError::transient(format!("{} refused", config.id)))
                    .with_cleanup(cleanup);
            }
            let backend = StaticBackend::new(config.id.clone(), "counting").with_capability("tools", 2);
            let id = config.id.clone();
            let app = Router::new().route("/", get(move || async move { id }));
            LoadResult::success(Arc::new(backend), app).with_cleanup(cleanup)
        }
    }

    fn factory_with_counting() -> (Arc<LoaderFactory>, Arc<AtomicUsize>) {
        let factory = LoaderFactory::with_defaults();
        let cleanups = Arc::new(AtomicUsize::new(0));
        factory.register(
            "counting",
            Arc::new(CountingLoader {
                cleanups: cleanups.clone(),
            }),
        );
        (factory, cleanups)
    }

    fn composite(members: serde_json::Value) -> ServerConfig {
        ServerConfig::new("bundle", "composite")
            .with_settings(serde_json::json!({ "servers": members }))
    }

    #[tokio::test]
    async fn test_members_nested_and_capabilities_summed() {
        let (factory, cleanups) = factory_with_counting();
        let loader = factory.get_loader("composite").unwrap();
        let result = loader
            .load(&composite(serde_json::json!([
                {"id": "a", "type": "counting"},
                {"id": "b", "type": "counting", "mount_path": "/bee"},
            ])))
            .await;
        assert!(result.is_success(), "{:?}", result.error());

        let caps = result.server().unwrap().capabilities();
        assert_eq!(caps["tools"], 4);
        assert_eq!(caps["members"], 2);

        let app = result.app().unwrap().clone();
        let response = app
            .clone()
            .oneshot(Request::get("/bee").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"b");

        let listing = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(listing.status(), StatusCode::OK);

        result.cleanup().unwrap().run().await.unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_member_failure_cleans_up_everything() {
        let (factory, cleanups) = factory_with_counting();
        let loader = factory.get_loader("composite").unwrap();
        let result = loader
            .load(&composite(serde_json::json!([
                {"id": "ok", "type": "counting"},
                {"id": "broken", "type": "counting", "settings": {"fail": true}},
            ])))
            .await;
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Transient);
        assert!(err.message.contains("member 'broken': broken refused"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_member_type_is_configuration() {
        let (factory, _) = factory_with_counting();
        let loader = factory.get_loader("composite").unwrap();
        let result = loader
            .load(&composite(serde_json::json!([{"id": "x", "type": "graphql"}])))
            .await;
        let err = result.error().unwrap();
        assert_eq!(err.kind, LoadErrorKind::Configuration);
        assert!(err.message.contains("no loader for type 'graphql'"));
    }

    #[tokio::test]
    async fn test_duplicate_member_mount_rejected() {
        let (factory, _) = factory_with_counting();
        let loader = factory.get_loader("composite").unwrap();
        let result = loader
            .load(&composite(serde_json::json!([
                {"id": "a", "type": "counting", "mount_path": "/same"},
                {"id": "b", "type": "counting", "mount_path": "/same"},
            ])))
            .await;
        assert_eq!(result.error().unwrap().kind, LoadErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_dropped_factory_is_unexpected() {
        let loader = CompositeLoader::new(Weak::new());
        let result = loader
            .load(&composite(serde_json::json!([{"id": "a", "type": "counting"}])))
            .await;
        assert_eq!(result.error().unwrap().kind, LoadErrorKind::Unexpected);
    }
}
