//! Credential storage for manifold.
//!
//! This crate provides secure storage for per-backend secrets: OAuth
//! token records and client identities obtained through static
//! configuration or dynamic registration.
//!
//! # Storage Location
//!
//! Credentials are stored in a platform-specific data directory:
//! - Linux: `~/.local/share/manifold/credentials.json`
//! - macOS: `~/Library/Application Support/manifold/credentials.json`
//! - Windows: `%APPDATA%/manifold/credentials.json`
//!
//! The file is created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use manifold_credentials::{CredentialStore, TokenRecord};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CredentialStore::new()?;
//!
//!     store
//!         .set_tokens(
//!             "srv/weather",
//!             TokenRecord {
//!                 access_token: "at-...".to_string(),
//!                 refresh_token: Some("rt-...".to_string()),
//!                 expires_at: Some(1_800_000_000),
//!                 scope: None,
//!             },
//!         )
//!         .await?;
//!
//!     if let Some(tokens) = store.get_tokens("srv/weather").await? {
//!         println!("token expires at {:?}", tokens.expires_at);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod store;

pub use error::{CredentialError, CredentialResult};
pub use store::{default_credentials_path, ClientIdentity, CredentialStore, TokenRecord};

/// Get the current time as epoch seconds.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
