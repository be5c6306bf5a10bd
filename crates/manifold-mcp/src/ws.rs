//! WebSocket transport for remote MCP backends.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// The backend URL (`ws://` or `wss://`).
    pub url: String,
    /// Optional bearer token injected as `Authorization`.
    pub auth_token: Option<String>,
    /// Extra headers sent with the upgrade request.
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// WebSocket transport.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl WsTransport {
    /// Connect to the backend and start the response reader.
    pub async fn connect(config: WsConfig) -> McpResult<Self> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| McpError::connection_failed(format!("Invalid WebSocket URL: {e}")))?;

        if let Some(ref token) = config.auth_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| McpError::connection_failed("Invalid authorization token"))?;
            request.headers_mut().insert("Authorization", value);
        }
        for (key, value) in &config.headers {
            let name: tokio_tungstenite::tungstenite::http::header::HeaderName = key
                .parse()
                .map_err(|_| McpError::connection_failed(format!("Invalid header name: {key}")))?;
            let value = value
                .parse()
                .map_err(|_| McpError::connection_failed(format!("Invalid header value for {key}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(ref response) if response.status().as_u16() == 401 => {
                McpError::AuthRequired
            }
            other => McpError::connection_failed(format!("WebSocket connect failed: {other}")),
        })?;

        let (sink, mut source) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&text) {
                                let sender = pending.lock().await.remove(&response.id);
                                if let Some(tx) = sender {
                                    let _ = tx.send(response);
                                } else {
                                    debug!(id = response.id, "Response with no pending request");
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                pending.lock().await.clear();
            })
        };

        debug!(url = %config.url, "WebSocket transport connected");

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            connected,
            reader: Mutex::new(Some(reader)),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn send_text(&self, payload: String) -> McpResult<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(payload))
            .await
            .map_err(|e| McpError::connection_failed(format!("WebSocket send failed: {e}")))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("WebSocket closed"));
        }

        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method = %request.method, "Sending WebSocket request");

        if let Err(e) = self.send_text(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed("WebSocket closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("WebSocket closed"));
        }
        let payload = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending WebSocket notification");
        self.send_text(payload).await
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.pending.lock().await.clear();
        debug!("Closed WebSocket transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
