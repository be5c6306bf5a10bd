//! OAuth 2.1 authorization subsystem for remote MCP backends.
//!
//! Implements the full browser-based authorization-code flow with PKCE:
//! metadata discovery, dynamic client registration, the redirect
//! round-trip through the gateway's callback endpoint, token exchange
//! and proactive refresh.
//!
//! # Flow
//!
//! ```text
//! metadata_discovery → client_registration → authorization_redirect
//!        → authorization_code → token_request → complete
//! ```
//!
//! Each step either advances or records a terminal error, collapsing the
//! run to `complete`. Runs are single-use; callers construct a fresh
//! [`AuthFlow`] per attempt.

mod flow;
mod metadata;
mod pkce;
mod register;
mod sessions;
mod tokens;

pub use flow::{AuthFlow, Authorizer, FlowStep};
pub use metadata::{discover, Discovery, ResourceMetadata, ServerMetadata};
pub use pkce::{challenge_for, generate_pkce, generate_state, verify_challenge, PkcePair};
pub use register::{redirect_uri_for_port, register_client};
pub use sessions::{OAuthSession, OAuthSessionStore, OAUTH_SESSION_TTL};
pub use tokens::{exchange_code, refresh_grant, select_client_auth, ClientAuth, TokenResponse};

/// How an authorization attempt failed.
///
/// The category only changes presentation, never control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    /// Network failure or timeout talking to the provider.
    Network,
    /// The provider's metadata is missing a required capability.
    Metadata,
    /// The provider denied the request at the protocol level.
    Denied,
    /// No usable client identity.
    InvalidClient,
    /// The requested scope was rejected.
    InvalidScope,
    /// PKCE/state mismatch (possible forgery).
    StateMismatch,
    /// The user cancelled the authorization.
    Cancelled,
    /// Too many concurrent authorization attempts.
    Capacity,
}

/// A terminal authorization error with a user-facing message.
#[derive(Debug, Clone)]
pub struct OAuthError {
    /// Error category.
    pub kind: OAuthErrorKind,
    /// User-facing message.
    pub message: String,
    /// Whether retrying the attempt can plausibly succeed.
    pub recoverable: bool,
}

impl OAuthError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::Network,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::Metadata,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::Denied,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::InvalidClient,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::InvalidScope,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn state_mismatch(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::StateMismatch,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::Cancelled,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self {
            kind: OAuthErrorKind::Capacity,
            message: message.into(),
            recoverable: true,
        }
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OAuthError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        assert!(OAuthError::network("timeout").recoverable);
        assert!(OAuthError::cancelled("closed window").recoverable);
        assert!(OAuthError::capacity("too many").recoverable);
        assert!(!OAuthError::metadata("no S256").recoverable);
        assert!(!OAuthError::denied("access_denied").recoverable);
        assert!(!OAuthError::invalid_client("none").recoverable);
        assert!(!OAuthError::state_mismatch("forged").recoverable);
    }

    #[test]
    fn test_error_display_is_message() {
        let err = OAuthError::denied("the provider said no");
        assert_eq!(err.to_string(), "the provider said no");
        assert_eq!(err.kind, OAuthErrorKind::Denied);
    }
}
