//! Per-client gateway sessions.
//!
//! A session is created by a protocol `initialize` request and lives
//! until the client deletes it or its stream closes. Each session
//! carries the backend scope resolved from its profile at creation
//! time.

use manifold_mcp::protocol::JsonRpcResponse;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

/// One live client session.
pub struct Session {
    /// Opaque, unguessable identifier.
    pub id: String,
    /// Profile the session was created under, if any.
    pub profile_id: Option<String>,
    /// Backend ids visible to this session; `None` means all.
    pub scope: Option<Vec<String>>,
    /// Server-to-client message channel.
    response_tx: mpsc::UnboundedSender<JsonRpcResponse>,
    /// Receiver side, taken by the first GET stream.
    response_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcResponse>>>,
    /// Session creation time.
    pub created_at: Instant,
}

/// The live-session map.
pub struct SessionMap {
    sessions: RwLock<HashMap<String, std::sync::Arc<Session>>>,
}

impl SessionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a new session, returning its id.
    pub async fn create(&self, profile_id: Option<String>, scope: Option<Vec<String>>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            id: id.clone(),
            profile_id,
            scope,
            response_tx: tx,
            response_rx: Mutex::new(Some(rx)),
            created_at: Instant::now(),
        };
        self.sessions
            .write()
            .await
            .insert(id.clone(), std::sync::Arc::new(session));
        info!(session_id = %id, "Session created");
        id
    }

    /// Look up a session.
    pub async fn get(&self, session_id: &str) -> Option<std::sync::Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove a session. Returns whether it existed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Session removed");
        }
        removed
    }

    /// Push a server-initiated message to a session.
    pub async fn send(&self, session_id: &str, response: JsonRpcResponse) -> Result<(), ()> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) => session.response_tx.send(response).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Take the message stream; only the first caller gets it.
    pub async fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcResponse>> {
        let taken = self.response_rx.lock().await.take();
        if taken.is_some() {
            debug!(session_id = %self.id, "Session stream attached");
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let map = SessionMap::new();
        let id = map.create(None, None).await;

        let session = map.get(&id).await.unwrap();
        assert_eq!(session.id, id);
        assert!(session.profile_id.is_none());
        assert!(session.scope.is_none());
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let map = SessionMap::new();
        let a = map.create(None, None).await;
        let b = map.create(None, None).await;
        assert_ne!(a, b);
        assert_eq!(map.len().await, 2);
    }

    #[tokio::test]
    async fn test_scoped_session() {
        let map = SessionMap::new();
        let id = map
            .create(
                Some("dev".to_string()),
                Some(vec!["srv/a".to_string(), "srv/b".to_string()]),
            )
            .await;

        let session = map.get(&id).await.unwrap();
        assert_eq!(session.profile_id.as_deref(), Some("dev"));
        assert_eq!(session.scope.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let map = SessionMap::new();
        let id = map.create(None, None).await;

        assert!(map.remove(&id).await);
        assert!(!map.remove(&id).await);
        assert!(map.get(&id).await.is_none());
        assert!(map.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_roundtrip() {
        let map = SessionMap::new();
        let id = map.create(None, None).await;

        let session = map.get(&id).await.unwrap();
        let mut rx = session.take_stream().await.unwrap();
        // The stream is handed out once.
        assert!(session.take_stream().await.is_none());

        map.send(&id, JsonRpcResponse::success(1, serde_json::json!({})))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_session() {
        let map = SessionMap::new();
        let result = map
            .send("ghost", JsonRpcResponse::success(1, serde_json::json!({})))
            .await;
        assert!(result.is_err());
    }
}
