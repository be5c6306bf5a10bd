//! Short-lived authorization-session storage.
//!
//! Each authorization attempt stores its PKCE verifier and context here,
//! keyed by `(origin, state)`. A session is consumed exactly once by the
//! token-exchange step; leftovers are purged by the expiry sweep. The
//! store caps concurrent attempts rather than relying on expiry alone.

use super::OAuthError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// How long an authorization session stays valid.
pub const OAUTH_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

/// Default cap on concurrent sessions across all origins.
const MAX_SESSIONS: usize = 32;

/// Default cap on concurrent sessions per origin.
const MAX_SESSIONS_PER_ORIGIN: usize = 4;

/// One in-flight authorization attempt.
#[derive(Debug, Clone)]
pub struct OAuthSession {
    /// Backend resource origin.
    pub origin: String,
    /// State nonce for this attempt.
    pub state: String,
    /// PKCE code verifier.
    pub verifier: String,
    /// PKCE code challenge.
    pub challenge: String,
    /// Requested scopes.
    pub scopes: Option<String>,
    /// Resource indicator sent to the token endpoint.
    pub resource: Option<String>,
    /// When the session was created.
    pub created_at: Instant,
}

struct Entry {
    session: OAuthSession,
    expires_at: Instant,
}

/// In-memory store of in-flight authorization sessions.
pub struct OAuthSessionStore {
    entries: Mutex<HashMap<(String, String), Entry>>,
    ttl: Duration,
    max_sessions: usize,
    max_per_origin: usize,
}

impl OAuthSessionStore {
    /// Create a store with the default TTL and caps.
    pub fn new() -> Self {
        Self::with_limits(OAUTH_SESSION_TTL, MAX_SESSIONS, MAX_SESSIONS_PER_ORIGIN)
    }

    /// Create a store with custom limits.
    pub fn with_limits(ttl: Duration, max_sessions: usize, max_per_origin: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_sessions,
            max_per_origin,
        }
    }

    /// Store a new session.
    ///
    /// Fails when the state nonce is already in use for the origin, or
    /// when a capacity cap would be exceeded.
    pub async fn insert(&self, session: OAuthSession) -> Result<(), OAuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);

        let key = (session.origin.clone(), session.state.clone());
        if entries.contains_key(&key) {
            return Err(OAuthError::state_mismatch(
                "State nonce already in use for this origin",
            ));
        }
        if entries.len() >= self.max_sessions {
            return Err(OAuthError::capacity(
                "Too many concurrent authorization attempts",
            ));
        }
        let per_origin = entries
            .keys()
            .filter(|(origin, _)| *origin == session.origin)
            .count();
        if per_origin >= self.max_per_origin {
            return Err(OAuthError::capacity(format!(
                "Too many concurrent authorization attempts for {}",
                session.origin
            )));
        }

        debug!(origin = %session.origin, "Stored authorization session");
        entries.insert(
            key,
            Entry {
                expires_at: now + self.ttl,
                session,
            },
        );
        Ok(())
    }

    /// Consume the session for `(origin, state)`.
    ///
    /// Expired sessions are not returned.
    pub async fn take(&self, origin: &str, state: &str) -> Option<OAuthSession> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&(origin.to_string(), state.to_string()))?;
        if entry.expires_at <= now {
            debug!(origin = %origin, "Authorization session expired");
            return None;
        }
        Some(entry.session)
    }

    /// Drop expired sessions.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Drop every session (process-wide reset).
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for OAuthSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(origin: &str, state: &str) -> OAuthSession {
        OAuthSession {
            origin: origin.to_string(),
            state: state.to_string(),
            verifier: "verifier".to_string(),
            challenge: "challenge".to_string(),
            scopes: None,
            resource: None,
            created_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_take() {
        let store = OAuthSessionStore::new();
        store.insert(session("https://a.test", "s1")).await.unwrap();

        let taken = store.take("https://a.test", "s1").await.unwrap();
        assert_eq!(taken.verifier, "verifier");

        // Consumed exactly once.
        assert!(store.take("https://a.test", "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_take_wrong_state() {
        let store = OAuthSessionStore::new();
        store.insert(session("https://a.test", "s1")).await.unwrap();

        assert!(store.take("https://a.test", "s2").await.is_none());
        // The s1 session was not consumed by the miss.
        assert!(store.take("https://a.test", "s1").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_state_rejected() {
        let store = OAuthSessionStore::new();
        store.insert(session("https://a.test", "s1")).await.unwrap();

        let err = store.insert(session("https://a.test", "s1")).await.unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::StateMismatch);

        // Same state under another origin is a different key.
        store.insert(session("https://b.test", "s1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_session_not_returned() {
        let store = OAuthSessionStore::with_limits(Duration::from_millis(10), 32, 4);
        store.insert(session("https://a.test", "s1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.take("https://a.test", "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = OAuthSessionStore::with_limits(Duration::from_millis(10), 32, 4);
        store.insert(session("https://a.test", "s1")).await.unwrap();
        store.insert(session("https://a.test", "s2")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.purge_expired().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_per_origin_cap() {
        let store = OAuthSessionStore::with_limits(OAUTH_SESSION_TTL, 32, 2);
        store.insert(session("https://a.test", "s1")).await.unwrap();
        store.insert(session("https://a.test", "s2")).await.unwrap();

        let err = store.insert(session("https://a.test", "s3")).await.unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::Capacity);

        // Another origin still has room.
        store.insert(session("https://b.test", "s1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_total_cap() {
        let store = OAuthSessionStore::with_limits(OAUTH_SESSION_TTL, 2, 2);
        store.insert(session("https://a.test", "s1")).await.unwrap();
        store.insert(session("https://b.test", "s1")).await.unwrap();

        let err = store.insert(session("https://c.test", "s1")).await.unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::Capacity);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = OAuthSessionStore::new();
        store.insert(session("https://a.test", "s1")).await.unwrap();
        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_slots_are_reusable() {
        let store = OAuthSessionStore::with_limits(Duration::from_millis(10), 1, 1);
        store.insert(session("https://a.test", "s1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The expired entry no longer counts against the cap.
        store.insert(session("https://a.test", "s2")).await.unwrap();
    }
}
