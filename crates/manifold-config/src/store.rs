//! JSON file-backed configuration store.
//!
//! Backends, profiles and call statistics are persisted as separate JSON
//! files under the configuration directory. All reads go through an
//! in-memory cache guarded by an `RwLock`; every mutation saves the owning
//! file atomically (write to a temp file, then rename) and broadcasts the
//! changed section to subscribers.

use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    BackendConfig, BackendStatus, CallStats, ConfigSection, Profile,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const BACKENDS_FILE: &str = "backends.json";
const PROFILES_FILE: &str = "profiles.json";
const STATS_FILE: &str = "stats.json";

/// On-disk shape of the profiles file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilesFile {
    /// Whether profile-scoped endpoints are enabled at all.
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug, Default)]
struct Cache {
    backends: Vec<BackendConfig>,
    profiles: ProfilesFile,
    stats: CallStats,
}

/// Configuration store shared across the gateway.
pub struct ConfigStore {
    dir: PathBuf,
    cache: RwLock<Cache>,
    changes: broadcast::Sender<ConfigSection>,
}

/// Get the default configuration directory for the current platform.
///
/// Returns `None` if the config directory cannot be determined.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("manifold"))
}

impl ConfigStore {
    /// Open the store at the given directory, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let cache = Cache {
            backends: read_json(&dir.join(BACKENDS_FILE)).await?.unwrap_or_default(),
            profiles: read_json(&dir.join(PROFILES_FILE)).await?.unwrap_or_default(),
            stats: read_json(&dir.join(STATS_FILE)).await?.unwrap_or_default(),
        };

        debug!(
            dir = %dir.display(),
            backends = cache.backends.len(),
            profiles = cache.profiles.profiles.len(),
            "Loaded configuration"
        );

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            dir,
            cache: RwLock::new(cache),
            changes,
        })
    }

    /// Open the store at the platform default directory.
    pub async fn open_default() -> ConfigResult<Self> {
        let dir = default_config_dir().ok_or(ConfigError::NoConfigDir)?;
        Self::open(dir).await
    }

    /// Subscribe to change notifications, keyed by section.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigSection> {
        self.changes.subscribe()
    }

    fn notify(&self, section: ConfigSection) {
        // No subscribers is fine.
        let _ = self.changes.send(section);
    }

    // ------------------------------------------------------------------
    // Backends
    // ------------------------------------------------------------------

    /// All configured backends.
    pub async fn backends(&self) -> Vec<BackendConfig> {
        self.cache.read().await.backends.clone()
    }

    /// Look up one backend by id.
    pub async fn backend(&self, id: &str) -> ConfigResult<BackendConfig> {
        self.cache
            .read()
            .await
            .backends
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBackend(id.to_string()))
    }

    /// Insert or replace a backend, matching on id.
    pub async fn upsert_backend(&self, backend: BackendConfig) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            match cache.backends.iter_mut().find(|b| b.id == backend.id) {
                Some(existing) => *existing = backend,
                None => cache.backends.push(backend),
            }
            write_json(&self.dir.join(BACKENDS_FILE), &cache.backends).await?;
        }
        self.notify(ConfigSection::Backends);
        Ok(())
    }

    /// Remove a backend from the configuration.
    pub async fn remove_backend(&self, id: &str) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            let before = cache.backends.len();
            cache.backends.retain(|b| b.id != id);
            if cache.backends.len() == before {
                return Err(ConfigError::UnknownBackend(id.to_string()));
            }
            write_json(&self.dir.join(BACKENDS_FILE), &cache.backends).await?;
        }
        self.notify(ConfigSection::Backends);
        Ok(())
    }

    /// Update a backend's status and error fields.
    pub async fn set_backend_status(
        &self,
        id: &str,
        status: BackendStatus,
        error: Option<&str>,
        error_detail: Option<&str>,
    ) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            let backend = cache
                .backends
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| ConfigError::UnknownBackend(id.to_string()))?;
            backend.status = status;
            backend.latest_error = error.map(str::to_string);
            backend.latest_error_detail = error_detail.map(str::to_string);
            write_json(&self.dir.join(BACKENDS_FILE), &cache.backends).await?;
        }
        self.notify(ConfigSection::Backends);
        Ok(())
    }

    /// Update a backend's error fields without touching its status.
    pub async fn set_backend_error(
        &self,
        id: &str,
        error: Option<&str>,
        error_detail: Option<&str>,
    ) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            let backend = cache
                .backends
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| ConfigError::UnknownBackend(id.to_string()))?;
            backend.latest_error = error.map(str::to_string);
            backend.latest_error_detail = error_detail.map(str::to_string);
            write_json(&self.dir.join(BACKENDS_FILE), &cache.backends).await?;
        }
        self.notify(ConfigSection::Backends);
        Ok(())
    }

    /// Enable or disable a backend.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            let backend = cache
                .backends
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| ConfigError::UnknownBackend(id.to_string()))?;
            backend.enabled = enabled;
            write_json(&self.dir.join(BACKENDS_FILE), &cache.backends).await?;
        }
        self.notify(ConfigSection::Backends);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Whether profile-scoped endpoints are enabled.
    pub async fn profiles_enabled(&self) -> bool {
        self.cache.read().await.profiles.enabled
    }

    /// All configured profiles.
    pub async fn profiles(&self) -> Vec<Profile> {
        self.cache.read().await.profiles.profiles.clone()
    }

    /// Look up one profile by id.
    pub async fn profile(&self, id: &str) -> Option<Profile> {
        self.cache
            .read()
            .await
            .profiles
            .profiles
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Enable or disable the profile feature.
    pub async fn set_profiles_enabled(&self, enabled: bool) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            cache.profiles.enabled = enabled;
            write_json(&self.dir.join(PROFILES_FILE), &cache.profiles).await?;
        }
        self.notify(ConfigSection::Profiles);
        Ok(())
    }

    /// Insert or replace a profile, matching on id.
    pub async fn upsert_profile(&self, profile: Profile) -> ConfigResult<()> {
        {
            let mut cache = self.cache.write().await;
            match cache
                .profiles
                .profiles
                .iter_mut()
                .find(|p| p.id == profile.id)
            {
                Some(existing) => *existing = profile,
                None => cache.profiles.profiles.push(profile),
            }
            write_json(&self.dir.join(PROFILES_FILE), &cache.profiles).await?;
        }
        self.notify(ConfigSection::Profiles);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Current call statistics.
    pub async fn stats(&self) -> CallStats {
        self.cache.read().await.stats.clone()
    }

    /// Record one successful tool call for a backend.
    ///
    /// Returns the updated statistics so callers can broadcast them.
    pub async fn record_call(&self, backend_id: &str, at_epoch_secs: u64) -> ConfigResult<CallStats> {
        let stats = {
            let mut cache = self.cache.write().await;
            cache.stats.total_calls += 1;
            cache.stats.last_called_at = Some(at_epoch_secs);
            let entry = cache.stats.backends.entry(backend_id.to_string()).or_default();
            entry.calls += 1;
            entry.last_called_at = Some(at_epoch_secs);
            write_json(&self.dir.join(STATS_FILE), &cache.stats).await?;
            cache.stats.clone()
        };
        self.notify(ConfigSection::Stats);
        Ok(stats)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> ConfigResult<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> ConfigResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
