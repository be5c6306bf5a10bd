//! OAuth redirect-callback hub.
//!
//! The gateway server owns the HTTP side of the redirect URI; this hub
//! holds the pending authorization attempts, keyed by state nonce. A
//! delivery resolves exactly the waiter that registered the matching
//! state; a callback carrying an unknown state resolves nothing, so
//! other outstanding attempts stay live.

use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Query parameters delivered by the provider redirect.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// What a waiter receives: the authorization code, or the provider's
/// error description.
pub type CallbackOutcome = Result<String, String>;

/// Pending authorization attempts keyed by state nonce.
pub struct CallbackHub {
    pending: Mutex<HashMap<String, oneshot::Sender<CallbackOutcome>>>,
}

impl CallbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for the given state nonce.
    pub async fn register(&self, state: impl Into<String>) -> oneshot::Receiver<CallbackOutcome> {
        let state = state.into();
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().await.insert(state.clone(), tx);
        if previous.is_some() {
            warn!(state = %state, "Replaced an existing callback waiter");
        }
        rx
    }

    /// Deliver redirect parameters to the matching waiter.
    ///
    /// Returns `true` when a waiter consumed the delivery. A missing or
    /// unknown state leaves every registered waiter untouched.
    pub async fn deliver(&self, params: CallbackParams) -> bool {
        let Some(state) = params.state else {
            warn!("OAuth callback without state parameter");
            return false;
        };

        let sender = self.pending.lock().await.remove(&state);
        let Some(sender) = sender else {
            warn!(state = %state, "OAuth callback with no matching waiter");
            return false;
        };

        let outcome = match (params.error, params.code) {
            (Some(error), _) => {
                let message = params.error_description.unwrap_or(error);
                Err(message)
            }
            (None, Some(code)) if !code.is_empty() => Ok(code),
            (None, _) => Err("No authorization code provided".to_string()),
        };

        debug!(state = %state, ok = outcome.is_ok(), "Delivering OAuth callback");
        let _ = sender.send(outcome);
        true
    }

    /// Cancel one pending attempt.
    pub async fn cancel(&self, state: &str) {
        if let Some(sender) = self.pending.lock().await.remove(state) {
            let _ = sender.send(Err("Authorization cancelled".to_string()));
        }
    }

    /// Cancel every pending attempt (process shutdown).
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err("Gateway shutting down".to_string()));
        }
    }

    /// Number of outstanding waiters.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// State nonces with an outstanding waiter.
    pub async fn pending_states(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}

impl Default for CallbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// HTML response for successful authorization.
pub const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Manifold - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #101418; color: #eee; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #4ade80; margin-bottom: 1rem; }
    p { color: #aaa; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this window and return to Manifold.</p>
  </div>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

/// HTML response for failed authorization.
pub fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Manifold - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #101418; color: #eee; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #f87171; margin-bottom: 1rem; }}
    p {{ color: #aaa; }}
    .error {{ color: #fca5a5; font-family: monospace; margin-top: 1rem; padding: 1rem; background: rgba(248,113,113,0.1); border-radius: 0.5rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Failed</h1>
    <p>An error occurred during authorization.</p>
    <div class="error">{}</div>
  </div>
</body>
</html>"#,
        html_escape(error)
    )
}

/// Escape HTML special characters.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(state: &str, code: &str) -> CallbackParams {
        CallbackParams {
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            error: None,
            error_description: None,
        }
    }

    #[tokio::test]
    async fn test_deliver_to_registered_waiter() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        assert!(hub.deliver(params("s1", "code-1")).await);
        assert_eq!(rx.await.unwrap(), Ok("code-1".to_string()));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_state_consumes_nothing() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        // A callback for a different state must not touch the s1 waiter.
        assert!(!hub.deliver(params("s2", "code-2")).await);
        assert_eq!(hub.pending_count().await, 1);

        // The s1 waiter is still deliverable afterwards.
        assert!(hub.deliver(params("s1", "code-1")).await);
        assert_eq!(rx.await.unwrap(), Ok("code-1".to_string()));
    }

    #[tokio::test]
    async fn test_missing_state_rejected() {
        let hub = CallbackHub::new();
        let _rx = hub.register("s1").await;

        let delivered = hub
            .deliver(CallbackParams {
                code: Some("code".to_string()),
                ..Default::default()
            })
            .await;
        assert!(!delivered);
        assert_eq!(hub.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_provider_error_forwarded() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        let delivered = hub
            .deliver(CallbackParams {
                code: None,
                state: Some("s1".to_string()),
                error: Some("access_denied".to_string()),
                error_description: Some("User denied the request".to_string()),
            })
            .await;
        assert!(delivered);
        assert_eq!(rx.await.unwrap(), Err("User denied the request".to_string()));
    }

    #[tokio::test]
    async fn test_error_without_description_uses_code() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        hub.deliver(CallbackParams {
            code: None,
            state: Some("s1".to_string()),
            error: Some("access_denied".to_string()),
            error_description: None,
        })
        .await;
        assert_eq!(rx.await.unwrap(), Err("access_denied".to_string()));
    }

    #[tokio::test]
    async fn test_empty_code_rejected() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        hub.deliver(params("s1", "")).await;
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_multiple_concurrent_waiters() {
        let hub = CallbackHub::new();
        let rx1 = hub.register("s1").await;
        let rx2 = hub.register("s2").await;

        assert!(hub.deliver(params("s2", "code-2")).await);
        assert!(hub.deliver(params("s1", "code-1")).await);

        assert_eq!(rx1.await.unwrap(), Ok("code-1".to_string()));
        assert_eq!(rx2.await.unwrap(), Ok("code-2".to_string()));
    }

    #[tokio::test]
    async fn test_cancel() {
        let hub = CallbackHub::new();
        let rx = hub.register("s1").await;

        hub.cancel("s1").await;
        assert!(rx.await.unwrap().is_err());
        assert!(!hub.deliver(params("s1", "late")).await);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let hub = CallbackHub::new();
        let rx1 = hub.register("s1").await;
        let rx2 = hub.register("s2").await;

        hub.cancel_all().await;
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(hub.pending_count().await, 0);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("a & b"), "a &amp; b");
        assert_eq!(html_escape("\"quoted\""), "&quot;quoted&quot;");
        assert_eq!(html_escape("it's"), "it&#39;s");
    }

    #[test]
    fn test_html_error_escapes_payload() {
        let html = html_error("<script>alert('xss')</script>");
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_html_success_content() {
        assert!(HTML_SUCCESS.contains("Authorization Successful"));
        assert!(HTML_SUCCESS.contains("window.close()"));
    }
}
