//! Buffered streamable-HTTP transport for remote MCP backends.
//!
//! Each request is a single HTTP POST; the response body is either plain
//! JSON or a one-shot SSE stream that carries the JSON-RPC response. The
//! backend may assign a session id via the `mcp-session-id` header, which
//! is echoed on subsequent requests.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Session id header used by the streamable HTTP transport.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// The backend URL (e.g., `https://mcp.example.com/mcp`)
    pub url: String,
    /// Optional bearer token injected as `Authorization`.
    pub auth_token: Option<String>,
    /// Extra headers sent on every request.
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 60,
        }
    }
}

/// Buffered streamable-HTTP transport.
pub struct StreamableTransport {
    config: HttpConfig,
    client: Client,
    connected: AtomicBool,
    /// Session id assigned by the backend.
    session_id: RwLock<Option<String>>,
}

impl StreamableTransport {
    /// Create a new streamable transport.
    pub fn new(config: HttpConfig) -> McpResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Build a POST with the common headers.
    async fn build_request(&self, body: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(ref session_id) = *self.session_id.read().await {
            req = req.header(SESSION_ID_HEADER, session_id);
        }

        req
    }

    /// Parse the POST response body.
    async fn parse_response(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Backend returned {status}: {text}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if content_type.contains("text/event-stream") {
            self.parse_sse_body(response).await
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol_error(format!("Failed to read response: {e}")))?;

            serde_json::from_str(&text)
                .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))
        }
    }

    /// Scan a one-shot SSE body for the JSON-RPC response.
    async fn parse_sse_body(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk =
                chunk_result.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            for line in buffer.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(data) {
                        return Ok(response);
                    }
                }
            }

            // Keep only the trailing incomplete line.
            if let Some(last_newline) = buffer.rfind('\n') {
                buffer = buffer[last_newline + 1..].to_string();
            }
        }

        Err(McpError::protocol_error(
            "SSE stream ended without response",
        ))
    }

    async fn remember_session_id(&self, response: &reqwest::Response) {
        if let Some(session_id) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write().await = Some(id.to_string());
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let request_json = serde_json::to_string(&request)?;

        debug!(id = request.id, method = %request.method, "Sending HTTP request");

        let response = self
            .build_request(request_json)
            .await
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::Timeout
                } else if e.is_connect() {
                    McpError::connection_failed(format!("Connection failed: {e}"))
                } else {
                    McpError::protocol_error(format!("Request failed: {e}"))
                }
            })?;

        self.remember_session_id(&response).await;
        self.connected.store(true, Ordering::SeqCst);
        self.parse_response(response).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let notification_json = serde_json::to_string(&notification)?;

        debug!(method = %notification.method, "Sending HTTP notification");

        let response = self
            .build_request(notification_json)
            .await
            .send()
            .await
            .map_err(|e| McpError::protocol_error(format!("Notification failed: {e}")))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification returned non-success status");
        }

        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Closed streamable HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
