//! Backend connection manager.
//!
//! Owns the set of live backend connections. For each backend it selects
//! a transport from the descriptor, substitutes placeholder values,
//! injects the current access token, connects and discovers tools. On an
//! authentication failure it can run the OAuth flow and retry the
//! connect exactly once. Proactive token refresh is scheduled per
//! backend and cancelled on stop.
//!
//! Operations against the same backend id are serialized through a
//! per-id lock, so at most one live connection per backend can ever
//! exist; operations against different backends proceed concurrently.

use crate::error::{McpError, McpResult};
use crate::eventstream::{EventStreamConfig, EventStreamTransport};
use crate::oauth::Authorizer;
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    ListToolsResult, McpTool, ToolCallResult,
};
use crate::stdio::{StdioConfig, StdioTransport};
use crate::streamable::{HttpConfig, StreamableTransport};
use crate::substitute::{substitute, substitute_map};
use crate::transport::{Transport, TransportKind};
use crate::ws::{WsConfig, WsTransport};
use manifold_config::{BackendConfig, BackendStatus, ConfigStore, TransportDesc};
use manifold_credentials::{now_epoch_secs, CredentialStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tokens this close to expiry are refreshed before use (seconds).
pub const TOKEN_REFRESH_WINDOW_SECS: u64 = 5 * 60;

/// Transport connect/request timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 60;

/// One aggregated, uniquely-named tool.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Identifier of the owning backend.
    pub backend_id: String,
    /// Short code of the owning backend.
    pub backend_code: String,
    /// Globally unique name exposed to clients.
    pub wrapper_name: String,
    /// The backend's original tool definition.
    pub tool: McpTool,
}

/// Replace path separators so an identifier can live inside a tool name.
pub fn sanitize_backend_id(id: &str) -> String {
    id.replace('/', "_")
}

/// A live backend connection. Never persisted.
struct Connection {
    backend: BackendConfig,
    transport: Arc<dyn Transport>,
    capabilities: InitializeResult,
    tools: Vec<McpTool>,
}

impl Connection {
    fn supports_tools(&self) -> bool {
        self.capabilities.capabilities.tools.is_some()
    }
}

/// The resolved transport half of a backend descriptor.
enum ResolvedTransport {
    Stdio(StdioConfig),
    Remote {
        url: String,
        headers: HashMap<String, String>,
        /// Bearer token extracted from a configured Authorization header.
        header_token: Option<String>,
    },
}

fn resolve_transport(backend: &BackendConfig) -> ResolvedTransport {
    let values = &backend.input_values;
    match &backend.transport {
        TransportDesc::Command { command, args, env } => ResolvedTransport::Stdio(StdioConfig {
            command: substitute(command, values),
            args: args.iter().map(|a| substitute(a, values)).collect(),
            env: substitute_map(env, values),
            timeout_secs: CONNECT_TIMEOUT_SECS,
        }),
        TransportDesc::Url { url, headers } => {
            let mut headers = substitute_map(headers, values);
            let header_token = headers
                .remove("Authorization")
                .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string));
            ResolvedTransport::Remote {
                url: substitute(url, values),
                headers,
                header_token,
            }
        }
    }
}

/// Manager of live backend connections.
pub struct ConnectionManager {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    authorizer: Authorizer,
    connections: RwLock<HashMap<String, Connection>>,
    /// Per-backend locks serializing start/stop against the same id.
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Proactive token-refresh tasks keyed by backend id.
    refresh_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Request id counter shared across connections.
    next_id: AtomicU64,
    /// Fires whenever the set of live tools may have changed.
    catalog_changed: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a manager over the given stores.
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        authorizer: Authorizer,
    ) -> Self {
        let (catalog_changed, _) = broadcast::channel(16);
        Self {
            config,
            credentials,
            authorizer,
            connections: RwLock::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            refresh_timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            catalog_changed,
        }
    }

    /// Subscribe to catalog-change notifications.
    pub fn subscribe_catalog(&self) -> broadcast::Receiver<()> {
        self.catalog_changed.subscribe()
    }

    fn notify_catalog(&self) {
        let _ = self.catalog_changed.send(());
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn op_lock(&self, backend_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .lock()
            .await
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a backend.
    ///
    /// Idempotent: a live connection for the id returns immediately. On
    /// an authentication failure with `auto_authorize` set, the OAuth
    /// flow runs and the connect is retried exactly once.
    pub async fn start(&self, backend_id: &str, auto_authorize: bool) -> McpResult<()> {
        let lock = self.op_lock(backend_id).await;
        let _guard = lock.lock().await;

        if self.connections.read().await.contains_key(backend_id) {
            debug!(backend = %backend_id, "Already running");
            return Ok(());
        }

        let backend = self.config.backend(backend_id).await?;
        self.config
            .set_backend_status(backend_id, BackendStatus::Starting, None, None)
            .await?;

        info!(backend = %backend_id, "Connecting to backend");

        match self.connect_with_auth(&backend, auto_authorize).await {
            Ok(connection) => {
                let tool_count = connection.tools.len();
                self.connections
                    .write()
                    .await
                    .insert(backend_id.to_string(), connection);
                self.config
                    .set_backend_status(backend_id, BackendStatus::Running, None, None)
                    .await?;
                info!(backend = %backend_id, tool_count, "Backend connected");
                self.notify_catalog();
                self.schedule_token_refresh(&backend).await;
                Ok(())
            }
            Err(McpError::AuthRequired) => {
                self.config
                    .set_backend_status(
                        backend_id,
                        BackendStatus::Stopped,
                        Some("auth"),
                        Some("Backend requires authorization"),
                    )
                    .await?;
                Err(McpError::AuthRequired)
            }
            Err(e) => {
                self.config
                    .set_backend_status(
                        backend_id,
                        BackendStatus::Stopped,
                        Some("unknown"),
                        Some(&e.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn connect_with_auth(
        &self,
        backend: &BackendConfig,
        auto_authorize: bool,
    ) -> McpResult<Connection> {
        let resolved = resolve_transport(backend);

        let token = match &resolved {
            ResolvedTransport::Remote {
                url, header_token, ..
            } => match header_token {
                Some(token) => Some(token.clone()),
                None => self.current_token(&backend.id, url).await?,
            },
            ResolvedTransport::Stdio(_) => None,
        };

        match self.open_and_initialize(backend, &resolved, token).await {
            Err(McpError::AuthRequired) => {
                let ResolvedTransport::Remote { url, .. } = &resolved else {
                    return Err(McpError::AuthRequired);
                };
                if !auto_authorize {
                    return Err(McpError::AuthRequired);
                }
                info!(backend = %backend.id, "Backend requires authorization, starting OAuth flow");
                let tokens = self
                    .authorizer
                    .authorize(&backend.id, url, None)
                    .await
                    .map_err(|e| McpError::AuthFailed(e.to_string()))?;
                // Rebuild the transport with the fresh token; one retry only.
                self.open_and_initialize(backend, &resolved, Some(tokens.access_token))
                    .await
            }
            other => other,
        }
    }

    /// The current access token for a backend, refreshing first when it
    /// is within the expiry window. Expired and unrefreshable tokens are
    /// not injected.
    async fn current_token(
        &self,
        backend_id: &str,
        resource_url: &str,
    ) -> McpResult<Option<String>> {
        let Some(tokens) = self.credentials.get_tokens(backend_id).await? else {
            return Ok(None);
        };

        if tokens.expires_within(now_epoch_secs(), TOKEN_REFRESH_WINDOW_SECS) {
            debug!(backend = %backend_id, "Token expiring soon, refreshing");
            if self.authorizer.refresh(backend_id, resource_url).await {
                let refreshed = self.credentials.get_tokens(backend_id).await?;
                return Ok(refreshed.map(|t| t.access_token));
            }
            if tokens.expires_at.is_some_and(|exp| exp <= now_epoch_secs()) {
                // Already expired and not refreshable.
                return Ok(None);
            }
        }

        Ok(Some(tokens.access_token))
    }

    async fn open_and_initialize(
        &self,
        backend: &BackendConfig,
        resolved: &ResolvedTransport,
        token: Option<String>,
    ) -> McpResult<Connection> {
        let transport: Arc<dyn Transport> = match resolved {
            ResolvedTransport::Stdio(config) => Arc::new(StdioTransport::spawn(config.clone())?),
            ResolvedTransport::Remote { url, headers, .. } => {
                match TransportKind::for_url(url)? {
                    TransportKind::WebSocket => Arc::new(
                        WsTransport::connect(WsConfig {
                            url: url.clone(),
                            auth_token: token,
                            headers: headers.clone(),
                            timeout_secs: CONNECT_TIMEOUT_SECS,
                        })
                        .await?,
                    ),
                    TransportKind::EventStream => Arc::new(
                        EventStreamTransport::connect(EventStreamConfig {
                            url: url.clone(),
                            auth_token: token,
                            headers: headers.clone(),
                            timeout_secs: CONNECT_TIMEOUT_SECS,
                        })
                        .await?,
                    ),
                    TransportKind::StreamableHttp => Arc::new(StreamableTransport::new(
                        HttpConfig {
                            url: url.clone(),
                            auth_token: token,
                            headers: headers.clone(),
                            timeout_secs: CONNECT_TIMEOUT_SECS,
                        },
                    )?),
                }
            }
        };

        let init_params = InitializeParams::default();
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "initialize",
            Some(serde_json::to_value(&init_params)?),
        );

        let response = match transport.request(request).await {
            Ok(response) => response,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        if let Some(error) = response.error {
            let _ = transport.close().await;
            return Err(McpError::InitializationFailed(error.message));
        }

        let capabilities: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing initialize result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))?;

        debug!(
            backend = %backend.id,
            protocol_version = %capabilities.protocol_version,
            server_name = %capabilities.server_info.name,
            "Backend initialized"
        );

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        let tools = self.list_tools_from(&transport).await?;

        Ok(Connection {
            backend: backend.clone(),
            transport,
            capabilities,
            tools,
        })
    }

    async fn list_tools_from(&self, transport: &Arc<dyn Transport>) -> McpResult<Vec<McpTool>> {
        let request = JsonRpcRequest::new(self.next_request_id(), "tools/list", None);
        let response = transport.request(request).await?;

        if let Some(error) = response.error {
            warn!(code = error.code, message = %error.message, "Failed to list tools");
            return Ok(Vec::new());
        }

        let result: ListToolsResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing tools/list result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))?;

        Ok(result.tools)
    }

    /// Stop a backend. Idempotent.
    pub async fn stop(&self, backend_id: &str) -> McpResult<()> {
        let lock = self.op_lock(backend_id).await;
        let _guard = lock.lock().await;

        self.cancel_refresh_timer(backend_id).await;

        let removed = self.connections.write().await.remove(backend_id);
        if let Some(connection) = removed {
            if let Err(e) = connection.transport.close().await {
                warn!(backend = %backend_id, error = %e, "Error closing backend connection");
            }
            if self.config.backend(backend_id).await.is_ok() {
                self.config
                    .set_backend_status(backend_id, BackendStatus::Stopped, None, None)
                    .await?;
            }
            info!(backend = %backend_id, "Backend disconnected");
            self.notify_catalog();
        }
        Ok(())
    }

    /// Stop everything, then start every enabled backend.
    pub async fn reload(&self) -> McpResult<()> {
        info!("Reloading backends");
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await?;
        }
        for backend in self.config.backends().await {
            if backend.enabled {
                if let Err(e) = self.start(&backend.id, false).await {
                    warn!(backend = %backend.id, error = %e, "Backend failed to start during reload");
                }
            }
        }
        Ok(())
    }

    /// Stop all backends and cancel every timer (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(backend = %id, error = %e, "Error stopping backend during shutdown");
            }
        }
        let mut timers = self.refresh_timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        self.authorizer.sessions().clear().await;
    }

    /// Lifecycle status of a backend: the persisted field when the
    /// backend is configured, otherwise derived from liveness.
    pub async fn status(&self, backend_id: &str) -> BackendStatus {
        match self.config.backend(backend_id).await {
            Ok(backend) => backend.status,
            Err(_) => {
                if self.connections.read().await.contains_key(backend_id) {
                    BackendStatus::Running
                } else {
                    BackendStatus::Stopped
                }
            }
        }
    }

    /// Whether a backend has a live connection.
    pub async fn is_running(&self, backend_id: &str) -> bool {
        self.connections.read().await.contains_key(backend_id)
    }

    /// Number of live connections.
    pub async fn live_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Identifiers of backends with a live connection.
    pub async fn live_backend_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Flattened catalog across live connections.
    ///
    /// Natural wrapper names are `{code}__{tool}`. When two live
    /// backends collide on a natural name, every colliding entry is
    /// renamed to `{id}__{code}__{tool}` with `/` replaced by `_`. The
    /// computation is per pass; names relax back when a collider
    /// disappears.
    pub async fn aggregate_tools(&self) -> Vec<ToolEntry> {
        let connections = self.connections.read().await;
        let mut ordered: Vec<(&String, &Connection)> = connections
            .iter()
            .filter(|(_, conn)| conn.supports_tools())
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let mut natural_counts: HashMap<String, usize> = HashMap::new();
        for (_, conn) in &ordered {
            for tool in &conn.tools {
                let natural = format!("{}__{}", conn.backend.code, tool.name);
                *natural_counts.entry(natural).or_default() += 1;
            }
        }

        let mut entries = Vec::new();
        for (id, conn) in &ordered {
            for tool in &conn.tools {
                let natural = format!("{}__{}", conn.backend.code, tool.name);
                let wrapper_name = if natural_counts[&natural] > 1 {
                    format!("{}__{natural}", sanitize_backend_id(id))
                } else {
                    natural
                };
                entries.push(ToolEntry {
                    backend_id: (*id).clone(),
                    backend_code: conn.backend.code.clone(),
                    wrapper_name,
                    tool: tool.clone(),
                });
            }
        }
        entries
    }

    /// Invoke a tool on its owning backend.
    pub async fn call_tool(
        &self,
        backend_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> McpResult<ToolCallResult> {
        let transport = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(backend_id)
                .ok_or_else(|| McpError::BackendNotFound(backend_id.to_string()))?;
            if !conn.tools.iter().any(|t| t.name == tool_name) {
                return Err(McpError::ToolNotFound(tool_name.to_string()));
            }
            conn.transport.clone()
        };

        debug!(tool = tool_name, backend = %backend_id, "Calling tool");

        let params = CallToolParams {
            name: tool_name.to_string(),
            arguments: Some(arguments),
        };
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );

        let response = transport.request(request).await?;

        if let Some(error) = response.error {
            return Err(McpError::tool_error(error.message));
        }

        serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing tools/call result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))
    }

    /// Stop a backend and wipe everything stored for it.
    pub async fn clear_authorization(&self, backend_id: &str) -> McpResult<()> {
        self.stop(backend_id).await?;
        self.credentials.clear_backend(backend_id).await?;
        info!(backend = %backend_id, "Cleared credentials");
        Ok(())
    }

    async fn cancel_refresh_timer(&self, backend_id: &str) {
        if let Some(handle) = self.refresh_timers.lock().await.remove(backend_id) {
            handle.abort();
            debug!(backend = %backend_id, "Cancelled refresh timer");
        }
    }

    /// Schedule proactive refresh five minutes before token expiry.
    async fn schedule_token_refresh(&self, backend: &BackendConfig) {
        let TransportDesc::Url { url, .. } = &backend.transport else {
            return;
        };
        let url = substitute(url, &backend.input_values);

        let tokens = match self.credentials.get_tokens(&backend.id).await {
            Ok(Some(tokens)) => tokens,
            _ => return,
        };
        if tokens.refresh_token.is_none() {
            return;
        }
        let Some(expires_at) = tokens.expires_at else {
            return;
        };

        self.cancel_refresh_timer(&backend.id).await;

        let backend_id = backend.id.clone();
        let authorizer = self.authorizer.clone();
        let credentials = self.credentials.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut next_expiry = expires_at;
            loop {
                let fire_at = next_expiry.saturating_sub(TOKEN_REFRESH_WINDOW_SECS);
                let delay = fire_at.saturating_sub(now_epoch_secs());
                if delay > 0 {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }

                if authorizer.refresh(&backend_id, &url).await {
                    match credentials.get_tokens(&backend_id).await {
                        Ok(Some(tokens)) if tokens.refresh_token.is_some() => {
                            match tokens.expires_at {
                                Some(expiry) => next_expiry = expiry,
                                None => break,
                            }
                        }
                        _ => break,
                    }
                } else {
                    warn!(backend = %backend_id, "Proactive refresh failed, disabling backend");
                    let _ = config
                        .set_backend_error(&backend_id, Some("auth"), Some("Token refresh failed"))
                        .await;
                    let _ = config.set_enabled(&backend_id, false).await;
                    break;
                }
            }
        });

        self.refresh_timers
            .lock()
            .await
            .insert(backend.id.clone(), handle);
        debug!(backend = %backend.id, "Scheduled token refresh");
    }
}
