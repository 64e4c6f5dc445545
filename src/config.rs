//! Hub configuration: deserialization, normalization and validation.

use crate::error::HubError;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid regex"));

static MOUNT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/[A-Za-z0-9._-]+)+$").expect("valid regex"));

/// Prefix reserved for the hub's own status routes.
pub const RESERVED_PREFIX: &str = "/_hub";

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Unknown variables resolve to the empty string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), resolve_env_value(v)))
        .collect()
}

/// Resolve a single `${VAR}` reference; literals pass through unchanged.
pub fn resolve_env_value(value: &str) -> String {
    match parse_env_ref(value) {
        Some(var_name) => std::env::var(var_name).unwrap_or_default(),
        None => value.to_string(), // caught by validate(), but handle gracefully
    }
}

/// Normalize a mount path: leading slash, no trailing slash.
///
/// An empty or root-only input normalizes to `/`.
pub fn normalize_mount_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Top-level hub configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Process-wide hub settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HubSettings {
    /// Interval between health reconciliation passes. 0 disables the loop.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Watch the config file and apply changes while serving.
    #[serde(default = "default_enabled")]
    pub watch: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            watch: true,
        }
    }
}

/// How the delay between load attempts grows.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    /// Doubles after each failed attempt, capped at 30s.
    Exponential,
}

/// Configuration for a single managed server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to `/<id>` when omitted.
    pub mount_path: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Loader type tag (e.g. "openapi", "subprocess").
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub retry_backoff: Backoff,
    /// Bounded wait for backend readiness, per attempt. Default 30s.
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    /// Loader-specific settings; each loader validates its own shape.
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_settings() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ServerConfig {
    /// Build a config with defaults for every optional field.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            mount_path: None,
            enabled: true,
            kind: kind.into(),
            tags: Vec::new(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: Backoff::Fixed,
            readiness_timeout_secs: default_readiness_timeout_secs(),
            settings: default_settings(),
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Human-readable name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Normalized mount path. `/<id>` when not configured or when the
    /// configured path is the root.
    pub fn mount_path(&self) -> String {
        let configured = self.mount_path.as_deref().map(normalize_mount_path);
        match configured {
            Some(path) if path != "/" => path,
            _ => normalize_mount_path(&self.id),
        }
    }

    /// Attempt budget, never below one.
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Validate the shape shared by every loader kind.
    pub fn validate(&self) -> crate::Result<()> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(HubError::InvalidConfig(
                self.id.clone(),
                "id must start with an alphanumeric and contain only alphanumerics, '-' or '_'"
                    .to_string(),
            ));
        }

        if self.kind.trim().is_empty() {
            return Err(HubError::InvalidConfig(
                self.id.clone(),
                "'type' must not be empty".to_string(),
            ));
        }

        let mount = self.mount_path();
        if !MOUNT_PATTERN.is_match(&mount) {
            return Err(HubError::InvalidConfig(
                self.id.clone(),
                format!("mount_path '{}' is not a valid path prefix", mount),
            ));
        }
        if mount == RESERVED_PREFIX || mount.starts_with(&format!("{}/", RESERVED_PREFIX)) {
            return Err(HubError::InvalidConfig(
                self.id.clone(),
                format!("mount_path '{}' is reserved", mount),
            ));
        }

        if !self.settings.is_object() {
            return Err(HubError::InvalidConfig(
                self.id.clone(),
                "'settings' must be a table".to_string(),
            ));
        }

        // Env values must be ${VAR} references so secrets stay out of config files
        if let Some(env) = self.settings.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                let valid = value.as_str().and_then(parse_env_ref).is_some();
                if !valid {
                    return Err(HubError::InvalidConfig(
                        self.id.clone(),
                        format!(
                            "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                            key, value
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl HubConfig {
    /// Read and parse a TOML config file.
    pub async fn from_file(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HubError::Io(path.display().to_string(), e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| HubError::InvalidConfig(path.display().to_string(), e.to_string()))
    }

    /// Validate the config, failing fast before anything is loaded.
    pub fn validate(&self) -> crate::Result<()> {
        validate_servers(&self.servers)
    }
}

/// Validate a server list: unique ids, unique mount paths, then each entry.
///
/// Disabled servers are still checked for id and mount uniqueness: they
/// keep their mount path occupied with a fallback handle.
pub fn validate_servers(servers: &[ServerConfig]) -> crate::Result<()> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut seen_mounts: HashSet<String> = HashSet::new();

    for server in servers {
        if !seen_ids.insert(server.id.as_str()) {
            return Err(HubError::DuplicateId(server.id.clone()));
        }
        let mount = server.mount_path();
        if !seen_mounts.insert(mount.clone()) {
            return Err(HubError::DuplicateMountPath(mount));
        }
        server.validate()?;
    }

    Ok(())
}
