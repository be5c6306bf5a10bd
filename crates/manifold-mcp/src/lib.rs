//! MCP core for the manifold gateway.
//!
//! Everything between the configuration store and the unified endpoint
//! lives here: the JSON-RPC protocol types, the backend transports, the
//! OAuth authorization subsystem and the connection manager.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────┐     ┌──────────────┐
//! │   gateway    │────▶│ connection manager │────▶│   backends   │
//! │   server     │◀────│  + OAuth + tokens  │◀────│ (MCP servers)│
//! └──────────────┘     └────────────────────┘     └──────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: locally-spawned backends via stdin/stdout
//! - **WebSocket**: `ws://` / `wss://` URLs
//! - **event stream**: URLs ending in `/sse` (legacy HTTP+SSE)
//! - **streamable HTTP**: every other HTTP(S) URL
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use manifold_config::{BackendConfig, ConfigStore};
//! use manifold_credentials::CredentialStore;
//! use manifold_mcp::{Authorizer, CallbackHub, ConnectionManager};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(ConfigStore::open_default().await?);
//! let credentials = Arc::new(CredentialStore::new()?);
//! let callbacks = Arc::new(CallbackHub::new());
//! let authorizer = Authorizer::new(credentials.clone(), callbacks, 8090);
//!
//! let manager = ConnectionManager::new(config.clone(), credentials, authorizer);
//!
//! config
//!     .upsert_backend(BackendConfig::url(
//!         "srv/weather",
//!         "weather",
//!         "https://weather.example.com/mcp",
//!     ))
//!     .await?;
//! manager.start("srv/weather", false).await?;
//!
//! for entry in manager.aggregate_tools().await {
//!     println!("{}", entry.wrapper_name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod error;
mod eventstream;
mod manager;
pub mod oauth;
pub mod protocol;
pub mod schema;
mod stdio;
mod streamable;
pub mod substitute;
mod transport;
mod ws;

pub use callback::{CallbackHub, CallbackParams, HTML_SUCCESS};
pub use error::{McpError, McpResult};
pub use eventstream::{EventStreamConfig, EventStreamTransport};
pub use manager::{
    sanitize_backend_id, ConnectionManager, ToolEntry, TOKEN_REFRESH_WINDOW_SECS,
};
pub use oauth::{Authorizer, OAuthError, OAuthErrorKind};
pub use protocol::{McpTool, ToolCallResult, ToolContent};
pub use schema::SchemaNode;
pub use stdio::{StdioConfig, StdioTransport};
pub use streamable::{HttpConfig, StreamableTransport, SESSION_ID_HEADER};
pub use transport::{Transport, TransportKind};
pub use ws::{WsConfig, WsTransport};
