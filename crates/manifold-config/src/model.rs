//! Configuration data model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a configured backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Backend is not running.
    #[default]
    Stopped,
    /// Backend is being connected.
    Starting,
    /// Backend is connected and serving tools.
    Running,
    /// Backend is being torn down.
    Stopping,
}

/// How to reach a backend: a locally-spawned process or a remote URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportDesc {
    /// Spawn a local process speaking JSON-RPC over stdio.
    Command {
        /// Executable to run.
        command: String,
        /// Arguments passed to the executable.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Environment variables for the child process.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a remote endpoint. The concrete transport is inferred
    /// from the URL scheme and path suffix.
    Url {
        /// Endpoint URL.
        url: String,
        /// Extra headers sent on HTTP-based transports.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

/// One configured downstream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Stable identifier, used as the join key everywhere.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Short code used when generating wrapper tool names.
    pub code: String,
    /// Whether the backend should be connected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Transport descriptor.
    #[serde(flatten)]
    pub transport: TransportDesc,
    /// Free-form values substituted into `${{placeholder}}` tokens.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_values: HashMap<String, String>,
    /// Last observed lifecycle status.
    #[serde(default)]
    pub status: BackendStatus,
    /// Short code of the last failure ("auth", "unknown").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_error: Option<String>,
    /// Human-readable detail for the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_error_detail: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    /// Create a backend reached over a URL.
    pub fn url(id: impl Into<String>, code: impl Into<String>, url: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            id: id.into(),
            name: code.clone(),
            code,
            enabled: true,
            transport: TransportDesc::Url {
                url: url.into(),
                headers: HashMap::new(),
            },
            input_values: HashMap::new(),
            status: BackendStatus::Stopped,
            latest_error: None,
            latest_error_detail: None,
        }
    }

    /// Create a backend spawned as a local process.
    pub fn command(
        id: impl Into<String>,
        code: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let code = code.into();
        Self {
            id: id.into(),
            name: code.clone(),
            code,
            enabled: true,
            transport: TransportDesc::Command {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            input_values: HashMap::new(),
            status: BackendStatus::Stopped,
            latest_error: None,
            latest_error_detail: None,
        }
    }

    /// Disable the backend.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Add an input value used for placeholder substitution.
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_values.insert(key.into(), value.into());
        self
    }
}

/// A named subset of backends exposed as one scoped endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Profile identifier used in the scoped endpoint path.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Identifiers of the backends visible through this profile.
    pub backend_ids: Vec<String>,
}

/// Call counters for a single backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    /// Number of successful tool calls.
    pub calls: u64,
    /// Epoch seconds of the most recent successful call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_called_at: Option<u64>,
}

/// Aggregated tool-call statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    /// Total successful calls across all backends.
    pub total_calls: u64,
    /// Epoch seconds of the most recent successful call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_called_at: Option<u64>,
    /// Per-backend counters keyed by backend id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub backends: HashMap<String, BackendStats>,
}

/// Configuration sections used for change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    /// The backend list or a backend's fields changed.
    Backends,
    /// The profile list or the profile feature flag changed.
    Profiles,
    /// Call statistics changed.
    Stats,
}
