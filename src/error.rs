//! Error types for hub registry, configuration and lifecycle operations.
//!
//! Loader failures are not errors in this sense: they travel inside a
//! [`LoadResult`](crate::loader::LoadResult) as a [`LoadError`](crate::loader::LoadError).

use thiserror::Error;

/// Main error type for hub operations
#[derive(Error, Debug)]
pub enum HubError {
    /// A server with this id is already registered
    #[error("duplicate server id: {0}")]
    DuplicateId(String),

    /// No server with this id is registered
    #[error("server '{0}' not found")]
    NotFound(String),

    /// Two servers declare the same mount path
    #[error("duplicate mount path '{0}'")]
    DuplicateMountPath(String),

    /// Invalid configuration for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// No loader registered for a type tag
    #[error("no loader for type '{0}'")]
    NoLoader(String),

    /// Health probe failed for a named server
    #[error("server '{0}' is unhealthy: {1}")]
    Unhealthy(String, String),

    /// Lifecycle transition not permitted from the current status
    #[error("server '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// A cleanup action failed for a named server
    #[error("cleanup failed for server '{0}': {1}")]
    Cleanup(String, String),

    /// Reading or watching a file failed
    #[error("io error for '{0}': {1}")]
    Io(String, String),

    /// Hub is shutting down and refuses new work
    #[error("hub is shutting down")]
    ShuttingDown,
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_id_display() {
        let err = HubError::DuplicateId("weather".to_string());
        assert_eq!(err.to_string(), "duplicate server id: weather");
    }

    #[test]
    fn test_invalid_config_display() {
        let err = HubError::InvalidConfig(
            "weather".to_string(),
            "mount_path must start with '/'".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for server 'weather': mount_path must start with '/'"
        );
    }

    #[test]
    fn test_no_loader_display() {
        let err = HubError::NoLoader("graphql".to_string());
        assert_eq!(err.to_string(), "no loader for type 'graphql'");
    }
}
