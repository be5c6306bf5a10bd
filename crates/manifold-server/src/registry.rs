//! Aggregated tool registry and call dispatch.
//!
//! Holds the current wrapper-named catalog, reconciles it against each
//! discovery pass, and dispatches calls back to the owning connection
//! while keeping the usage counters.

use manifold_config::{CallStats, ConfigStore};
use manifold_credentials::now_epoch_secs;
use manifold_mcp::protocol::McpTool;
use manifold_mcp::{ConnectionManager, McpError, McpResult, SchemaNode, ToolCallResult, ToolEntry};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Broadcast to listeners after every successful dispatch.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    /// Backend that served the call.
    pub backend_id: String,
    /// Wrapper name the client called.
    pub wrapper_name: String,
    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: u64,
    /// Updated counters.
    pub stats: CallStats,
}

/// The registry of aggregated tools.
pub struct ToolRegistry {
    manager: Arc<ConnectionManager>,
    config: Arc<ConfigStore>,
    catalog: RwLock<HashMap<String, ToolEntry>>,
    usage: broadcast::Sender<UsageEvent>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new(manager: Arc<ConnectionManager>, config: Arc<ConfigStore>) -> Self {
        let (usage, _) = broadcast::channel(64);
        Self {
            manager,
            config,
            catalog: RwLock::new(HashMap::new()),
            usage,
        }
    }

    /// Subscribe to usage events.
    pub fn subscribe_usage(&self) -> broadcast::Receiver<UsageEvent> {
        self.usage.subscribe()
    }

    /// Rebuild the catalog from the current discovery pass.
    ///
    /// The new catalog replaces the old one wholesale under the write
    /// lock; the diff is only computed for logging, so unchanged entries
    /// are effectively untouched. Safe to call concurrently with session
    /// churn and dispatch.
    pub async fn refresh(&self) {
        let fresh: HashMap<String, ToolEntry> = self
            .manager
            .aggregate_tools()
            .await
            .into_iter()
            .map(|entry| (entry.wrapper_name.clone(), entry))
            .collect();

        let mut catalog = self.catalog.write().await;

        let removed: Vec<&String> = catalog.keys().filter(|k| !fresh.contains_key(*k)).collect();
        let added: Vec<&String> = fresh.keys().filter(|k| !catalog.contains_key(*k)).collect();
        for name in &removed {
            debug!(tool = %name, "Unregistered tool");
        }
        for name in &added {
            debug!(tool = %name, "Registered tool");
        }
        info!(
            total = fresh.len(),
            added = added.len(),
            removed = removed.len(),
            "Tool catalog refreshed"
        );

        *catalog = fresh;
    }

    /// Entries visible to a scope (`None` = every backend).
    pub async fn entries(&self, scope: Option<&[String]>) -> Vec<ToolEntry> {
        let catalog = self.catalog.read().await;
        catalog
            .values()
            .filter(|entry| match scope {
                Some(ids) => ids.contains(&entry.backend_id),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Wrapper-named tool definitions for a scope.
    pub async fn list_tools(&self, scope: Option<&[String]>) -> Vec<McpTool> {
        let mut tools: Vec<McpTool> = self
            .entries(scope)
            .await
            .into_iter()
            .map(|entry| McpTool {
                name: entry.wrapper_name,
                ..entry.tool
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Dispatch a call to the backend owning `wrapper_name`.
    ///
    /// Counters update only on success; the result or error always goes
    /// back to the caller.
    pub async fn dispatch(
        &self,
        wrapper_name: &str,
        arguments: Value,
        scope: Option<&[String]>,
    ) -> McpResult<ToolCallResult> {
        let entry = {
            let catalog = self.catalog.read().await;
            catalog
                .get(wrapper_name)
                .filter(|entry| match scope {
                    Some(ids) => ids.contains(&entry.backend_id),
                    None => true,
                })
                .cloned()
                .ok_or_else(|| McpError::ToolNotFound(wrapper_name.to_string()))?
        };

        if let Some(ref schema) = entry.tool.input_schema {
            SchemaNode::parse(schema)
                .validate(&arguments)
                .map_err(McpError::InvalidArguments)?;
        }

        let started = Instant::now();
        let result = self
            .manager
            .call_tool(&entry.backend_id, &entry.tool.name, arguments)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                match self
                    .config
                    .record_call(&entry.backend_id, now_epoch_secs())
                    .await
                {
                    Ok(stats) => {
                        let _ = self.usage.send(UsageEvent {
                            backend_id: entry.backend_id.clone(),
                            wrapper_name: wrapper_name.to_string(),
                            duration_ms,
                            stats,
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to record call statistics");
                    }
                }
            }
            Err(e) => {
                debug!(tool = %wrapper_name, error = %e, duration_ms, "Dispatch failed");
            }
        }

        result
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.catalog.read().await.len()
    }

    /// Whether the catalog is empty.
    pub async fn is_empty(&self) -> bool {
        self.catalog.read().await.is_empty()
    }
}
