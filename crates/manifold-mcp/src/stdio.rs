//! Stdio transport for locally-spawned MCP backends.
//!
//! Spawns the backend as a child process and speaks line-delimited
//! JSON-RPC over its stdin/stdout. Responses are matched to in-flight
//! requests by id; stderr is drained into the log.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stdio transport configuration.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Environment variables for the child process.
    pub env: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl StdioConfig {
    /// Create a config with the default timeout.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_secs: 60,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Stdio transport for a spawned backend process.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stderr_drain: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl StdioTransport {
    /// Spawn the backend process and start the response reader.
    pub fn spawn(config: StdioConfig) -> McpResult<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            McpError::ProcessError(format!("Failed to spawn {}: {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to capture stderr".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(&line) {
                        Ok(response) => {
                            let sender = pending.lock().await.remove(&response.id);
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(response);
                                }
                                None => {
                                    debug!(id = response.id, "Response with no pending request");
                                }
                            }
                        }
                        Err(_) => {
                            // Server-initiated notifications and anything
                            // else we don't track.
                            debug!(line = %line, "Ignoring non-response stdout line");
                        }
                    }
                }
                // EOF: the process exited or closed stdout.
                connected.store(false, Ordering::SeqCst);
                pending.lock().await.clear();
            })
        };

        let command_name = config.command.clone();
        let stderr_drain = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %command_name, "stderr: {line}");
            }
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            connected,
            reader: Mutex::new(Some(reader)),
            stderr_drain: Mutex::new(Some(stderr_drain)),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn write_line(&self, payload: &str) -> McpResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| McpError::ProcessError(format!("Failed to write to backend: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| McpError::ProcessError(format!("Failed to write to backend: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::ProcessError(format!("Failed to flush backend stdin: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("Backend process not running"));
        }

        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(id, method = %request.method, "Sending stdio request");

        if let Err(e) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed("Backend process exited")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::connection_failed("Backend process not running"));
        }
        let payload = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending stdio notification");
        self.write_line(&payload).await
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr_drain.lock().await.take() {
            handle.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill backend process");
            }
            let _ = child.wait().await;
        }

        self.pending.lock().await.clear();
        debug!("Closed stdio transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
