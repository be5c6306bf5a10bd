//! Error types for configuration operations.

use thiserror::Error;

/// Errors that can occur while reading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write a configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize configuration data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No backend is configured under the given identifier.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Could not determine the configuration directory.
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
