//! MCP error types.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Backend not found.
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend process failed.
    #[error("Backend process error: {0}")]
    ProcessError(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    ToolError(String),

    /// Tool arguments rejected by the input schema.
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend timeout.
    #[error("Backend timeout")]
    Timeout,

    /// Backend initialization failed.
    #[error("Backend initialization failed: {0}")]
    InitializationFailed(String),

    /// The backend rejected the connection and needs authorization.
    ///
    /// This is the distinguished signal callers use to prompt the user
    /// and retry with auto-authorization enabled.
    #[error("Authorization required")]
    AuthRequired,

    /// Authorization was attempted and failed.
    #[error("Authorization failed: {0}")]
    AuthFailed(String),

    /// Configuration store error.
    #[error("Config error: {0}")]
    Config(#[from] manifold_config::ConfigError),

    /// Credential store error.
    #[error("Credential error: {0}")]
    Credentials(#[from] manifold_credentials::CredentialError),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a tool error.
    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::ToolError(message.into())
    }

    /// Whether this error is the distinguished needs-authorization signal.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }
}
