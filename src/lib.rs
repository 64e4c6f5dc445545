//! MCP hub core: loads heterogeneous tool servers concurrently, mounts each
//! under its own path prefix, tracks their health, and tears them down.
//!
//! A [`Hub`] owns the [`Registry`] of server entries, the [`LoaderFactory`]
//! that maps type tags to [`Loader`]s, and the [`MountTable`] that routes
//! requests to loaded servers (or to a 503 fallback when a server failed).

pub mod config;
pub mod entry;
pub mod error;
pub mod factory;
pub mod hub;
pub mod loader;
pub mod mount;
pub mod registry;
pub mod standalone;

pub use config::{
    normalize_mount_path, parse_env_ref, resolve_env_vars, validate_servers, Backoff, HubConfig,
    HubSettings, ServerConfig,
};
pub use entry::{ServerEntry, ServerStatus, ServerSummary};
pub use error::{HubError, Result};
pub use factory::LoaderFactory;
pub use hub::{retry_delay, ApplyReport, Hub, ShutdownReport, StartupReport};
pub use loader::{
    Backend, CleanupAction, LoadError, LoadErrorKind, LoadResult, LoadedParts, Loader,
    StaticBackend,
};
pub use mount::{fallback_app, MountTable};
pub use registry::{ListFilter, Registry, RegistryStatistics};
pub use standalone::hot_reload::{reload_config, run_hot_reload};
pub use standalone::server::{app, serve};
