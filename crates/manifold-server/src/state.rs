//! Shared gateway state.

use crate::registry::ToolRegistry;
use crate::session::SessionMap;
use manifold_config::ConfigStore;
use manifold_credentials::CredentialStore;
use manifold_mcp::{CallbackHub, ConnectionManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Everything the gateway handlers need, constructed once at process
/// start and threaded through the router.
#[derive(Clone)]
pub struct GatewayState {
    /// Configuration store.
    pub config: Arc<ConfigStore>,
    /// Credential store.
    pub credentials: Arc<CredentialStore>,
    /// Backend connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Aggregated tool registry.
    pub registry: Arc<ToolRegistry>,
    /// Live client sessions.
    pub sessions: Arc<SessionMap>,
    /// Pending OAuth redirect waiters.
    pub callbacks: Arc<CallbackHub>,
    /// Port the gateway listens on.
    pub port: u16,
    /// Process start instant, for the health report.
    pub started_at: Instant,
}

/// Health report exposed to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Whether the listener is up (always true when this handler runs).
    pub listening: bool,
    /// Number of backends with a live connection.
    pub backends_running: usize,
    /// Seconds since process start.
    pub uptime_secs: u64,
}

impl GatewayState {
    /// Assemble the gateway state.
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        manager: Arc<ConnectionManager>,
        callbacks: Arc<CallbackHub>,
        port: u16,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::new(manager.clone(), config.clone()));
        Self {
            config,
            credentials,
            manager,
            registry,
            sessions: Arc::new(SessionMap::new()),
            callbacks,
            port,
            started_at: Instant::now(),
        }
    }

    /// Current health snapshot.
    pub async fn health(&self) -> Health {
        Health {
            listening: true,
            backends_running: self.manager.live_count().await,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Keep the registry in sync with connection-manager catalog events.
    pub fn spawn_catalog_refresher(&self) -> JoinHandle<()> {
        let mut rx = self.manager.subscribe_catalog();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    // A lagged receiver just means several passes were
                    // coalesced; one refresh catches up.
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        debug!("Catalog changed, refreshing registry");
                        registry.refresh().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
