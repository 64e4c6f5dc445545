//! Loaders bring up one kind of backend server and hand back a mountable app.
//!
//! Each submodule implements [`Loader`] for one backend kind. Loaders never
//! return `Err` or panic on expected failures: every failure path becomes a
//! failed [`LoadResult`].

pub mod cleanup;
pub mod composite;
pub mod module;
pub mod openapi;
pub mod process;
pub mod remote;
pub mod result;
pub mod subprocess;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::ServerConfig;

pub use cleanup::CleanupAction;
pub use result::{LoadError, LoadErrorKind, LoadResult, LoadedParts};

/// Opaque handle to a loaded backend, used for capability reporting and
/// periodic health checks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Loader kind that produced this backend.
    fn kind(&self) -> &str;

    /// Counts of exposed operations, keyed by operation class.
    fn capabilities(&self) -> BTreeMap<String, u64> {
        BTreeMap::new()
    }

    /// Probe the backend. An `Err` degrades a healthy entry.
    async fn health_check(&self) -> crate::Result<()>;
}

/// Brings up exactly one kind of backend from a server configuration.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Type tag this loader is registered under.
    fn kind(&self) -> &str;

    /// Load the backend described by `config`.
    async fn load(&self, config: &ServerConfig) -> LoadResult;
}

/// Deserialize a loader's settings table, mapping shape errors to a
/// non-retryable configuration failure.
pub(crate) fn parse_settings<T: DeserializeOwned>(config: &ServerConfig) -> Result<T, LoadError> {
    serde_json::from_value(config.settings.clone()).map_err(|e| {
        LoadError::configuration(format!(
            "invalid settings for {} server '{}': {}",
            config.kind, config.id, e
        ))
    })
}

/// Backend with no external resources; always healthy.
pub struct StaticBackend {
    id: String,
    kind: String,
    capabilities: BTreeMap<String, u64>,
}

impl StaticBackend {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            capabilities: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, name: &str, count: u64) -> Self {
        self.capabilities.insert(name.to_string(), count);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> BTreeMap<String, u64> {
        self.capabilities.clone()
    }

    async fn health_check(&self) -> crate::Result<()> {
        Ok(())
    }
}
