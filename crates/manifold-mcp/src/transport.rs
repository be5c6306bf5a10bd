//! MCP transport abstraction and transport-kind selection.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for a response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// The concrete transports a remote URL can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket (`ws://` or `wss://`).
    WebSocket,
    /// Legacy HTTP+SSE: GET opens an event stream, POST sends messages.
    EventStream,
    /// Streamable HTTP: one POST per request, response body is JSON or a
    /// one-shot SSE stream.
    StreamableHttp,
}

impl TransportKind {
    /// Select the transport for a remote URL by scheme and path suffix.
    pub fn for_url(raw: &str) -> McpResult<Self> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| McpError::connection_failed(format!("Invalid backend URL {raw}: {e}")))?;

        match parsed.scheme() {
            "ws" | "wss" => Ok(Self::WebSocket),
            "http" | "https" => {
                if parsed.path().trim_end_matches('/').ends_with("/sse") {
                    Ok(Self::EventStream)
                } else {
                    Ok(Self::StreamableHttp)
                }
            }
            other => Err(McpError::connection_failed(format!(
                "Unsupported URL scheme: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_schemes() {
        assert_eq!(
            TransportKind::for_url("ws://localhost:9000/mcp").unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            TransportKind::for_url("wss://example.com/mcp").unwrap(),
            TransportKind::WebSocket
        );
    }

    #[test]
    fn test_sse_suffix_selects_event_stream() {
        assert_eq!(
            TransportKind::for_url("https://example.com/sse").unwrap(),
            TransportKind::EventStream
        );
        assert_eq!(
            TransportKind::for_url("https://example.com/v1/sse/").unwrap(),
            TransportKind::EventStream
        );
    }

    #[test]
    fn test_plain_http_selects_streamable() {
        assert_eq!(
            TransportKind::for_url("https://example.com/mcp").unwrap(),
            TransportKind::StreamableHttp
        );
        assert_eq!(
            TransportKind::for_url("http://127.0.0.1:8080/").unwrap(),
            TransportKind::StreamableHttp
        );
        // "sse" has to be a path segment, not a substring.
        assert_eq!(
            TransportKind::for_url("https://example.com/assess").unwrap(),
            TransportKind::StreamableHttp
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(TransportKind::for_url("ftp://example.com").is_err());
        assert!(TransportKind::for_url("not a url").is_err());
    }
}
