//! Tracked state of one configured server.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::HubError;
use crate::loader::{Backend, CleanupAction, LoadedParts};

/// Lifecycle status of a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Configured but not enabled. Never loaded.
    Disabled,
    /// A load sequence is in flight.
    Loading,
    Healthy,
    /// Loaded, but the last health probe failed.
    Degraded,
    /// Retries exhausted or a non-retryable error.
    Failed,
}

impl ServerStatus {
    /// Whether the entry has a loaded backend behind it.
    pub fn is_loaded(self) -> bool {
        matches!(self, ServerStatus::Healthy | ServerStatus::Degraded)
    }

    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Healthy | Degraded | Failed, Loading) => true,
            (Loading, Healthy | Failed) => true,
            (Healthy, Degraded) | (Degraded, Healthy) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Disabled => "disabled",
            ServerStatus::Loading => "loading",
            ServerStatus::Healthy => "healthy",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Mutable record of one configured server, owned by the registry.
#[derive(Clone)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: String,
    pub tags: Vec<String>,
    pub mount_path: String,
    pub status: ServerStatus,
    pub capabilities: BTreeMap<String, u64>,
    pub error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Attempts consumed by the most recent load sequence.
    pub attempts: u32,
    /// Bumped whenever a load sequence starts.
    pub generation: u64,
    pub connection_info: serde_json::Map<String, serde_json::Value>,
    pub cleanup: Option<CleanupAction>,
    /// Handle currently mounted for this entry, real or fallback.
    pub app: Option<Router>,
    pub backend: Option<Arc<dyn Backend>>,
}

impl ServerEntry {
    /// New entry for `config`: `Loading` when enabled, `Disabled` otherwise.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            description: config.description.clone(),
            kind: config.kind.clone(),
            tags: config.tags.clone(),
            mount_path: config.mount_path(),
            status: if config.enabled {
                ServerStatus::Loading
            } else {
                ServerStatus::Disabled
            },
            capabilities: BTreeMap::new(),
            error: None,
            loaded_at: None,
            updated_at: Utc::now(),
            attempts: 0,
            generation: 0,
            connection_info: serde_json::Map::new(),
            cleanup: None,
            app: None,
            backend: None,
        }
    }

    fn transition(&mut self, next: ServerStatus) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HubError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `Loading` for a new load sequence and return its generation.
    pub fn begin_loading(&mut self) -> crate::Result<u64> {
        self.transition(ServerStatus::Loading)?;
        self.generation += 1;
        self.error = None;
        self.attempts = 0;
        Ok(self.generation)
    }

    /// Store a successful load. Returns the cleanup it replaces, if any.
    pub fn mark_healthy(
        &mut self,
        parts: LoadedParts,
        attempts: u32,
    ) -> crate::Result<Option<CleanupAction>> {
        self.transition(ServerStatus::Healthy)?;
        self.capabilities = parts.server.capabilities();
        self.backend = Some(parts.server);
        self.app = Some(parts.app);
        self.connection_info = parts.connection_info;
        self.loaded_at = Some(parts.loaded_at);
        self.error = None;
        self.attempts = attempts;
        Ok(std::mem::replace(&mut self.cleanup, parts.cleanup))
    }

    /// Record an exhausted load sequence. Returns the cleanup it replaces, if
    /// any; the failed entry itself holds no resources.
    pub fn mark_failed(
        &mut self,
        error: String,
        attempts: u32,
        fallback: Router,
    ) -> crate::Result<Option<CleanupAction>> {
        self.transition(ServerStatus::Failed)?;
        self.error = Some(error);
        self.attempts = attempts;
        self.capabilities.clear();
        self.connection_info.clear();
        self.backend = None;
        self.app = Some(fallback);
        Ok(self.cleanup.take())
    }

    /// Apply a health probe outcome. Only `Healthy` and `Degraded` entries move.
    pub fn apply_health(&mut self, outcome: Result<(), String>) -> bool {
        let next = match (&outcome, self.status) {
            (Ok(()), ServerStatus::Degraded) => ServerStatus::Healthy,
            (Err(_), ServerStatus::Healthy) => ServerStatus::Degraded,
            _ => return false,
        };
        self.status = next;
        self.updated_at = Utc::now();
        self.error = outcome.err();
        true
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServerStatus::Healthy
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            kind: self.kind.clone(),
            tags: self.tags.clone(),
            mount_path: self.mount_path.clone(),
            status: self.status,
            capabilities: self.capabilities.clone(),
            error: self.error.clone(),
            loaded_at: self.loaded_at,
            updated_at: self.updated_at,
            attempts: self.attempts,
            connection_info: self.connection_info.clone(),
        }
    }
}

impl fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("mount_path", &self.mount_path)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("attempts", &self.attempts)
            .field("generation", &self.generation)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// Serializable view of an entry for the status routes.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: Vec<String>,
    pub mount_path: String,
    pub status: ServerStatus,
    pub capabilities: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub connection_info: serde_json::Map<String, serde_json::Value>,
}
