//! Outcome of a single loader attempt.

use std::fmt;
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::loader::cleanup::CleanupAction;
use crate::loader::Backend;

/// Placeholder used when a loader reports a failure without a message.
const UNKNOWN_FAILURE: &str = "load failed without diagnostic output";

/// Failure classes, deciding whether a retry is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    /// Missing loader or malformed settings. Never retried.
    Configuration,
    /// Timeouts, refused connections, backend not yet ready.
    Transient,
    /// Backend process exited before becoming ready.
    Crash,
    /// Loader panicked or its task was aborted.
    Unexpected,
}

impl LoadErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, LoadErrorKind::Configuration)
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadErrorKind::Configuration => "configuration",
            LoadErrorKind::Transient => "transient",
            LoadErrorKind::Crash => "crash",
            LoadErrorKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// Human-readable load failure with its class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            UNKNOWN_FAILURE.to_string()
        } else {
            message
        };
        Self { kind, message }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Configuration, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Transient, message)
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Crash, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Unexpected, message)
    }
}

/// Outcome of one loader attempt. Built only through [`LoadResult::success`]
/// and [`LoadResult::failure`], so a successful result always carries an app
/// handle and a failed one always carries a non-empty error.
pub struct LoadResult {
    success: bool,
    error: Option<LoadError>,
    server: Option<Arc<dyn Backend>>,
    app: Option<Router>,
    connection_info: serde_json::Map<String, serde_json::Value>,
    loaded_at: Option<DateTime<Utc>>,
    cleanup: Option<CleanupAction>,
}

/// Owned pieces of a successful result, moved into the registry entry.
pub struct LoadedParts {
    pub server: Arc<dyn Backend>,
    pub app: Router,
    pub connection_info: serde_json::Map<String, serde_json::Value>,
    pub loaded_at: DateTime<Utc>,
    pub cleanup: Option<CleanupAction>,
}

impl LoadResult {
    pub fn success(server: Arc<dyn Backend>, app: Router) -> Self {
        Self {
            success: true,
            error: None,
            server: Some(server),
            app: Some(app),
            connection_info: serde_json::Map::new(),
            loaded_at: Some(Utc::now()),
            cleanup: None,
        }
    }

    pub fn failure(error: LoadError) -> Self {
        Self {
            success: false,
            error: Some(error),
            server: None,
            app: None,
            connection_info: serde_json::Map::new(),
            loaded_at: None,
            cleanup: None,
        }
    }

    /// Attach the teardown for resources opened by this attempt. Allowed on
    /// failures too, for resources acquired before the failure.
    pub fn with_cleanup(mut self, cleanup: CleanupAction) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_info(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.connection_info.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    pub fn server(&self) -> Option<&Arc<dyn Backend>> {
        self.server.as_ref()
    }

    pub fn app(&self) -> Option<&Router> {
        self.app.as_ref()
    }

    pub fn connection_info(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.connection_info
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn cleanup(&self) -> Option<&CleanupAction> {
        self.cleanup.as_ref()
    }

    /// Split a successful result into owned parts. Returns the failure back
    /// as `Err` when the attempt did not succeed.
    pub fn into_parts(self) -> Result<LoadedParts, LoadError> {
        match (self.server, self.app, self.error) {
            (Some(server), Some(app), None) => Ok(LoadedParts {
                server,
                app,
                connection_info: self.connection_info,
                loaded_at: self.loaded_at.unwrap_or_else(Utc::now),
                cleanup: self.cleanup,
            }),
            (_, _, Some(error)) => Err(error),
            _ => Err(LoadError::unexpected(UNKNOWN_FAILURE)),
        }
    }
}

impl fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadResult")
            .field("success", &self.success)
            .field("error", &self.error)
            .field("server", &self.server.as_ref().map(|s| s.kind().to_string()))
            .field("connection_info", &self.connection_info)
            .field("loaded_at", &self.loaded_at)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}
