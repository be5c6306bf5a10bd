//! Credential storage implementation.

use crate::error::{CredentialError, CredentialResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Tokens stored for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Bearer access token.
    pub access_token: String,
    /// Refresh token, when the server issued one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry as epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Granted scope string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenRecord {
    /// Whether the token expires within `window_secs` of `now` (or has
    /// already expired). Tokens without an expiry never report as
    /// expiring.
    pub fn expires_within(&self, now: u64, window_secs: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + window_secs,
            None => false,
        }
    }
}

/// OAuth client identity for one backend, from static configuration or
/// dynamic registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// OAuth client id.
    pub client_id: String,
    /// Client secret, when issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Epoch seconds the identity was issued, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,
}

/// Everything stored for one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    tokens: Option<TokenRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<ClientIdentity>,
}

impl BackendCredentials {
    fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.client.is_none()
    }
}

/// Secure storage for per-backend credentials.
///
/// Provides thread-safe access to stored credentials with automatic
/// file permission management on Unix systems.
pub struct CredentialStore {
    /// Path to the credential file.
    path: PathBuf,
    /// In-memory cache of credential data.
    cache: RwLock<Option<HashMap<String, BackendCredentials>>>,
}

/// Get the default credential file path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("manifold").join("credentials.json"))
}

impl CredentialStore {
    /// Create a new credential store using the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> CredentialResult<Self> {
        let path = default_credentials_path().ok_or(CredentialError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a credential store with a custom path.
    ///
    /// Useful for testing or custom configurations.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Get the path to the credential file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Get the stored tokens for a backend.
    pub async fn get_tokens(&self, backend_id: &str) -> CredentialResult<Option<TokenRecord>> {
        let all = self.all().await?;
        Ok(all.get(backend_id).and_then(|c| c.tokens.clone()))
    }

    /// Store tokens for a backend, replacing any previous record.
    pub async fn set_tokens(&self, backend_id: &str, tokens: TokenRecord) -> CredentialResult<()> {
        debug!(backend = %backend_id, "Storing tokens");
        let mut all = self.all().await?;
        all.entry(backend_id.to_string()).or_default().tokens = Some(tokens);
        self.write_all(&all).await?;
        *self.cache.write().await = None;
        Ok(())
    }

    /// Delete the stored tokens for a backend.
    ///
    /// Returns `true` if tokens were removed.
    pub async fn delete_tokens(&self, backend_id: &str) -> CredentialResult<bool> {
        let mut all = self.all().await?;
        let existed = match all.get_mut(backend_id) {
            Some(creds) => creds.tokens.take().is_some(),
            None => false,
        };
        if existed {
            all.retain(|_, c| !c.is_empty());
            self.write_all(&all).await?;
            *self.cache.write().await = None;
        }
        Ok(existed)
    }

    /// Whether a backend has stored tokens.
    pub async fn has_tokens(&self, backend_id: &str) -> CredentialResult<bool> {
        Ok(self.get_tokens(backend_id).await?.is_some())
    }

    /// Get the stored client identity for a backend.
    pub async fn get_client(&self, backend_id: &str) -> CredentialResult<Option<ClientIdentity>> {
        let all = self.all().await?;
        Ok(all.get(backend_id).and_then(|c| c.client.clone()))
    }

    /// Store the client identity for a backend.
    pub async fn set_client(
        &self,
        backend_id: &str,
        client: ClientIdentity,
    ) -> CredentialResult<()> {
        debug!(backend = %backend_id, client_id = %client.client_id, "Storing client identity");
        let mut all = self.all().await?;
        all.entry(backend_id.to_string()).or_default().client = Some(client);
        self.write_all(&all).await?;
        *self.cache.write().await = None;
        Ok(())
    }

    /// Delete everything stored for a backend.
    ///
    /// Returns `true` if anything was removed.
    pub async fn clear_backend(&self, backend_id: &str) -> CredentialResult<bool> {
        debug!(backend = %backend_id, "Clearing credentials");
        let mut all = self.all().await?;
        let existed = all.remove(backend_id).is_some();
        if existed {
            self.write_all(&all).await?;
            *self.cache.write().await = None;
        }
        Ok(existed)
    }

    /// List backend ids with any stored credentials.
    pub async fn backend_ids(&self) -> CredentialResult<Vec<String>> {
        let all = self.all().await?;
        Ok(all.keys().cloned().collect())
    }

    /// Get all stored credentials, reading through the cache.
    async fn all(&self) -> CredentialResult<HashMap<String, BackendCredentials>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_all().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    /// Read all credential data from file.
    async fn read_all(&self) -> CredentialResult<HashMap<String, BackendCredentials>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        // Parse as raw JSON first, then validate each entry so one bad
        // record does not poison the rest.
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        let mut result = HashMap::new();

        for (key, value) in raw {
            match serde_json::from_value::<BackendCredentials>(value) {
                Ok(creds) => {
                    result.insert(key, creds);
                }
                Err(e) => {
                    warn!(backend = %key, error = %e, "Skipping invalid credential entry");
                }
            }
        }

        Ok(result)
    }

    /// Write all credential data to file.
    async fn write_all(&self, data: &HashMap<String, BackendCredentials>) -> CredentialResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content).await?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    CredentialError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        self.path, e
                    ))
                })?;
        }

        debug!(path = ?self.path, "Wrote credential file");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
