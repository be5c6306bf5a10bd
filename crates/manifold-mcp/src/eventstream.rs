//! Legacy HTTP+SSE transport for remote MCP backends.
//!
//! The backend is joined by opening a long-lived GET event stream; the
//! first `endpoint` event names the URL requests are POSTed to, and
//! responses come back as `message` events on the stream.
//!
//! ```text
//! Gateway                            Backend
//!   │                                  │
//!   │── GET /sse ─────────────────────►│ (establish SSE connection)
//!   │◄── SSE: endpoint event ──────────│ (message URL)
//!   │                                  │
//!   │── POST <message URL> ───────────►│ (JSON-RPC requests)
//!   │◄── SSE: message event ───────────│ (responses via the stream)
//! ```

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Event-stream transport configuration.
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// The SSE endpoint URL (e.g., `https://mcp.example.com/sse`)
    pub url: String,
    /// Optional bearer token injected as `Authorization`.
    pub auth_token: Option<String>,
    /// Extra headers sent on every request.
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

/// One parsed SSE event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental SSE parser over a text buffer.
#[derive(Debug, Default)]
struct SseParser {
    current: SseEvent,
    events: Vec<SseEvent>,
}

impl SseParser {
    /// Feed one line of the stream.
    fn push_line(&mut self, line: &str) {
        if line.is_empty() {
            // Blank line terminates the event.
            if !self.current.data.is_empty() || !self.current.event.is_empty() {
                self.events.push(std::mem::take(&mut self.current));
            }
        } else if let Some(name) = line.strip_prefix("event: ") {
            self.current.event = name.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            if !self.current.data.is_empty() {
                self.current.data.push('\n');
            }
            self.current.data.push_str(data);
        }
        // Comment lines (":") and unknown fields are ignored.
    }

    fn drain(&mut self) -> Vec<SseEvent> {
        std::mem::take(&mut self.events)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type StashMap = Arc<Mutex<HashMap<u64, JsonRpcResponse>>>;

/// Legacy HTTP+SSE transport.
pub struct EventStreamTransport {
    config: EventStreamConfig,
    client: Client,
    /// Message endpoint announced by the backend.
    message_url: String,
    pending: PendingMap,
    /// Responses that arrived before their request registered a waiter.
    stash: StashMap,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl EventStreamTransport {
    /// Open the event stream and wait for the backend's endpoint event.
    pub async fn connect(config: EventStreamConfig) -> McpResult<Self> {
        let client = Client::builder()
            // The GET stream stays open indefinitely; only connect is bounded.
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        let mut req = client
            .get(&config.url)
            .header("Accept", "text/event-stream");
        if let Some(ref token) = config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        for (key, value) in &config.headers {
            req = req.header(key, value);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection_failed(format!("Connection failed: {e}"))
            } else {
                McpError::protocol_error(format!("SSE connect failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE endpoint returned {status}"
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stash: StashMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = pending.clone();
            let stash = stash.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                read_stream(response, endpoint_tx, pending, stash, connected).await;
            })
        };

        // The endpoint event must arrive before we can send anything.
        let endpoint = tokio::time::timeout(Duration::from_secs(config.timeout_secs), endpoint_rx)
            .await
            .map_err(|_| McpError::Timeout)?
            .map_err(|_| McpError::protocol_error("SSE stream closed before endpoint event"))?;

        let base = url::Url::parse(&config.url)
            .map_err(|e| McpError::connection_failed(format!("Invalid URL: {e}")))?;
        let message_url = base
            .join(&endpoint)
            .map_err(|e| McpError::protocol_error(format!("Invalid endpoint event: {e}")))?
            .to_string();

        debug!(message_url = %message_url, "Event stream established");

        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            config,
            client,
            message_url,
            pending,
            stash,
            connected,
            reader: Mutex::new(Some(reader)),
            timeout,
        })
    }

    /// The message endpoint announced by the backend.
    pub fn message_url(&self) -> &str {
        &self.message_url
    }

    async fn post_message(&self, payload: String) -> McpResult<()> {
        let mut req = self
            .client
            .post(&self.message_url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .body(payload);
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpError::protocol_error(format!("Message POST failed: {e}")))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !response.status().is_success() {
            return Err(McpError::protocol_error(format!(
                "Message endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Drive the SSE stream, routing responses to waiters.
async fn read_stream(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: PendingMap,
    stash: StashMap,
    connected: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::default();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Event stream error");
                break;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);
            parser.push_line(&line);
        }

        for event in parser.drain() {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data);
                    }
                }
                "message" | "" => {
                    if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                        let sender = pending.lock().await.remove(&response.id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                // The waiter may not have registered yet.
                                stash.lock().await.insert(response.id, response);
                            }
                        }
                    }
                }
                other => {
                    debug!(event = %other, "Ignoring unknown SSE event");
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    pending.lock().await.clear();
}

#[async_trait]
impl Transport for EventStreamTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("Event stream closed"));
        }

        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method = %request.method, "Sending event-stream request");

        if let Err(e) = self.post_message(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        // The response may already have arrived on the stream.
        if let Some(response) = self.stash.lock().await.remove(&id) {
            self.pending.lock().await.remove(&id);
            return Ok(response);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed("Event stream closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("Event stream closed"));
        }
        let payload = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending event-stream notification");
        self.post_message(payload).await
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
        self.stash.lock().await.clear();
        debug!("Closed event-stream transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parser_single_event() {
        let mut parser = SseParser::default();
        parser.push_line("event: endpoint");
        parser.push_line("data: /messages?sessionId=abc");
        parser.push_line("");

        let events = parser.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn test_parser_multiline_data() {
        let mut parser = SseParser::default();
        parser.push_line("data: line1");
        parser.push_line("data: line2");
        parser.push_line("");

        let events = parser.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_parser_ignores_comments() {
        let mut parser = SseParser::default();
        parser.push_line(": keep-alive");
        parser.push_line("");
        assert!(parser.drain().is_empty());
    }

    #[tokio::test]
    async fn test_connect_parses_endpoint() {
        let server = MockServer::start().await;
        let body = "event: endpoint\ndata: /messages?sessionId=s1\n\n";
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let config = EventStreamConfig {
            url: format!("{}/sse", server.uri()),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 5,
        };
        let transport = EventStreamTransport::connect(config).await.unwrap();
        assert!(transport
            .message_url()
            .ends_with("/messages?sessionId=s1"));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = EventStreamConfig {
            url: format!("{}/sse", server.uri()),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 5,
        };
        let result = EventStreamTransport::connect(config).await;
        assert!(matches!(result, Err(McpError::AuthRequired)));
    }

    #[tokio::test]
    async fn test_connect_without_endpoint_event_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(": nothing here\n\n"),
            )
            .mount(&server)
            .await;

        let config = EventStreamConfig {
            url: format!("{}/sse", server.uri()),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 1,
        };
        let result = EventStreamTransport::connect(config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = EventStreamConfig {
            url: "http://127.0.0.1:1/sse".to_string(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 1,
        };
        let result = EventStreamTransport::connect(config).await;
        assert!(result.is_err());
    }
}
