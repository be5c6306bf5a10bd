//! Configuration store for manifold.
//!
//! Persists the list of configured backends, the profile definitions and
//! the tool-call statistics, and notifies subscribers when a section
//! changes.
//!
//! # Storage Location
//!
//! Configuration lives in a platform-specific config directory:
//! - Linux: `~/.config/manifold/`
//! - macOS: `~/Library/Application Support/manifold/`
//! - Windows: `%APPDATA%/manifold/`
//!
//! # Example
//!
//! ```no_run
//! use manifold_config::{BackendConfig, ConfigStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ConfigStore::open_default().await?;
//!
//!     store
//!         .upsert_backend(BackendConfig::url(
//!             "srv/weather",
//!             "weather",
//!             "https://weather.example.com/mcp",
//!         ))
//!         .await?;
//!
//!     for backend in store.backends().await {
//!         println!("{} ({:?})", backend.id, backend.status);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod model;
mod store;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    BackendConfig, BackendStats, BackendStatus, CallStats, ConfigSection, Profile, TransportDesc,
};
pub use store::{default_config_dir, ConfigStore};
