//! The authorization state machine and its driver.

use super::metadata::{discover, origin_of, Discovery};
use super::pkce::{generate_pkce, generate_state};
use super::register::{redirect_uri_for_port, register_client};
use super::sessions::{OAuthSession, OAuthSessionStore, OAUTH_SESSION_TTL};
use super::tokens::{exchange_code, refresh_grant};
use super::OAuthError;
use crate::callback::CallbackHub;
use manifold_credentials::{ClientIdentity, CredentialStore, TokenRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Steps of an authorization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    MetadataDiscovery,
    ClientRegistration,
    AuthorizationRedirect,
    AuthorizationCode,
    TokenRequest,
    Complete,
}

/// Drives authorization runs and token refreshes for backends.
///
/// Constructed once at process start and shared; each authorization
/// attempt gets a fresh [`AuthFlow`].
#[derive(Clone)]
pub struct Authorizer {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    sessions: Arc<OAuthSessionStore>,
    callbacks: Arc<CallbackHub>,
    callback_port: u16,
    launch_browser: bool,
    callback_timeout: Duration,
}

impl Authorizer {
    /// Create an authorizer bound to the gateway's callback endpoint.
    pub fn new(
        credentials: Arc<CredentialStore>,
        callbacks: Arc<CallbackHub>,
        callback_port: u16,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            sessions: Arc::new(OAuthSessionStore::new()),
            callbacks,
            callback_port,
            launch_browser: true,
            callback_timeout: OAUTH_SESSION_TTL,
        }
    }

    /// Disable launching the system browser (tests drive the callback
    /// endpoint directly).
    pub fn without_browser(mut self) -> Self {
        self.launch_browser = false;
        self
    }

    /// Override how long a run waits for the redirect callback.
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// The redirect URI registered with every backend.
    pub fn redirect_uri(&self) -> String {
        redirect_uri_for_port(self.callback_port)
    }

    /// The authorization-session store.
    pub fn sessions(&self) -> &Arc<OAuthSessionStore> {
        &self.sessions
    }

    /// Run a full authorization for a backend, persisting the resulting
    /// tokens on success.
    pub async fn authorize(
        &self,
        backend_id: &str,
        resource_url: &str,
        static_client: Option<ClientIdentity>,
    ) -> Result<TokenRecord, OAuthError> {
        AuthFlow::new(self.clone(), backend_id, resource_url, static_client)
            .run()
            .await
    }

    /// Refresh a backend's tokens.
    ///
    /// Re-discovers the authorization server (endpoints may rotate) and
    /// performs a `refresh_token` grant. Returns whether the stored
    /// tokens were refreshed; failures never propagate.
    pub async fn refresh(&self, backend_id: &str, resource_url: &str) -> bool {
        let discovery = match discover(&self.http, resource_url).await {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!(backend = %backend_id, error = %e, "Refresh discovery failed");
                return false;
            }
        };

        let previous = match self.credentials.get_tokens(backend_id).await {
            Ok(Some(tokens)) if tokens.refresh_token.is_some() => tokens,
            Ok(_) => {
                debug!(backend = %backend_id, "No refresh token stored");
                return false;
            }
            Err(e) => {
                warn!(backend = %backend_id, error = %e, "Failed to read stored tokens");
                return false;
            }
        };

        let client = match self.credentials.get_client(backend_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                debug!(backend = %backend_id, "No client identity stored");
                return false;
            }
            Err(e) => {
                warn!(backend = %backend_id, error = %e, "Failed to read client identity");
                return false;
            }
        };

        let refreshed = refresh_grant(
            &self.http,
            &discovery.server.token_endpoint,
            &client,
            &discovery.server.token_endpoint_auth_methods_supported,
            &previous,
        )
        .await;

        match refreshed {
            Some(tokens) => {
                if let Err(e) = self.credentials.set_tokens(backend_id, tokens).await {
                    warn!(backend = %backend_id, error = %e, "Failed to persist refreshed tokens");
                    return false;
                }
                info!(backend = %backend_id, "Refreshed tokens");
                true
            }
            None => false,
        }
    }
}

/// One single-use authorization run.
///
/// Not resumable past a terminal error; construct a fresh flow per
/// attempt.
pub struct AuthFlow {
    ctx: Authorizer,
    backend_id: String,
    resource_url: String,
    static_client: Option<ClientIdentity>,
    step: FlowStep,
    discovery: Option<Discovery>,
    client: Option<ClientIdentity>,
    state_nonce: Option<String>,
    code: Option<String>,
    outcome: Option<Result<TokenRecord, OAuthError>>,
}

impl AuthFlow {
    /// Create a flow at the metadata-discovery step.
    pub fn new(
        ctx: Authorizer,
        backend_id: impl Into<String>,
        resource_url: impl Into<String>,
        static_client: Option<ClientIdentity>,
    ) -> Self {
        Self {
            ctx,
            backend_id: backend_id.into(),
            resource_url: resource_url.into(),
            static_client,
            step: FlowStep::MetadataDiscovery,
            discovery: None,
            client: None,
            state_nonce: None,
            code: None,
            outcome: None,
        }
    }

    /// Current step.
    pub fn step(&self) -> FlowStep {
        self.step
    }

    /// Drive the flow to completion.
    pub async fn run(mut self) -> Result<TokenRecord, OAuthError> {
        while self.step != FlowStep::Complete {
            self.advance().await;
        }
        self.outcome
            .unwrap_or_else(|| Err(OAuthError::network("Authorization ended without outcome")))
    }

    fn terminal(&mut self, error: OAuthError) {
        warn!(backend = %self.backend_id, error = %error, "Authorization failed");
        self.outcome = Some(Err(error));
        self.step = FlowStep::Complete;
    }

    /// Execute the current step and advance (or collapse to `Complete`).
    pub async fn advance(&mut self) {
        match self.step {
            FlowStep::MetadataDiscovery => self.step_metadata_discovery().await,
            FlowStep::ClientRegistration => self.step_client_registration().await,
            FlowStep::AuthorizationRedirect => self.step_authorization_redirect().await,
            FlowStep::AuthorizationCode => self.step_authorization_code(),
            FlowStep::TokenRequest => self.step_token_request().await,
            FlowStep::Complete => {}
        }
    }

    async fn step_metadata_discovery(&mut self) {
        match discover(&self.ctx.http, &self.resource_url).await {
            Ok(discovery) => {
                self.discovery = Some(discovery);
                self.step = FlowStep::ClientRegistration;
            }
            Err(e) => self.terminal(e),
        }
    }

    async fn step_client_registration(&mut self) {
        let Some(discovery) = self.discovery.clone() else {
            return self.terminal(OAuthError::metadata("Missing discovery context"));
        };

        // Statically configured identity wins, then a previously stored
        // one, then dynamic registration.
        if let Some(client) = self.static_client.take() {
            if let Err(e) = self.ctx.credentials.set_client(&self.backend_id, client.clone()).await
            {
                return self.terminal(OAuthError::network(format!(
                    "Failed to persist client identity: {e}"
                )));
            }
            self.client = Some(client);
            self.step = FlowStep::AuthorizationRedirect;
            return;
        }

        match self.ctx.credentials.get_client(&self.backend_id).await {
            Ok(Some(client)) => {
                debug!(backend = %self.backend_id, "Reusing stored client identity");
                self.client = Some(client);
                self.step = FlowStep::AuthorizationRedirect;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                return self.terminal(OAuthError::network(format!(
                    "Failed to read client identity: {e}"
                )))
            }
        }

        let redirect_uri = self.ctx.redirect_uri();
        match register_client(
            &self.ctx.http,
            &discovery.server,
            &redirect_uri,
            discovery.scopes.as_deref(),
        )
        .await
        {
            Ok(client) => {
                // Persist immediately so a crashed run keeps the identity.
                if let Err(e) = self
                    .ctx
                    .credentials
                    .set_client(&self.backend_id, client.clone())
                    .await
                {
                    return self.terminal(OAuthError::network(format!(
                        "Failed to persist client identity: {e}"
                    )));
                }
                self.client = Some(client);
                self.step = FlowStep::AuthorizationRedirect;
            }
            Err(e) => self.terminal(e),
        }
    }

    async fn step_authorization_redirect(&mut self) {
        let (Some(discovery), Some(client)) = (self.discovery.clone(), self.client.clone()) else {
            return self.terminal(OAuthError::metadata("Missing redirect context"));
        };

        let origin = match origin_of(&self.resource_url) {
            Ok(origin) => origin,
            Err(e) => return self.terminal(e),
        };

        let pkce = generate_pkce();
        let state = generate_state();

        let session = OAuthSession {
            origin: origin.clone(),
            state: state.clone(),
            verifier: pkce.verifier,
            challenge: pkce.challenge.clone(),
            scopes: discovery.scopes.clone(),
            resource: Some(self.resource_url.clone()),
            created_at: Instant::now(),
        };
        if let Err(e) = self.ctx.sessions.insert(session).await {
            return self.terminal(e);
        }

        let url = build_authorization_url(
            &discovery.server.authorization_endpoint,
            &client.client_id,
            &self.ctx.redirect_uri(),
            discovery.scopes.as_deref(),
            &state,
            &pkce.challenge,
            Some(&self.resource_url),
        );

        // Register the waiter before the browser can possibly redirect.
        let receiver = self.ctx.callbacks.register(state.clone()).await;
        self.state_nonce = Some(state.clone());

        if self.ctx.launch_browser {
            info!(backend = %self.backend_id, "Opening browser for authorization");
            if let Err(e) = open::that(&url) {
                warn!(error = %e, "Failed to open browser; authorize manually at {url}");
            }
        } else {
            debug!(url = %url, "Browser launch disabled");
        }

        match tokio::time::timeout(self.ctx.callback_timeout, receiver).await {
            Ok(Ok(Ok(code))) => {
                self.code = Some(code);
                self.step = FlowStep::AuthorizationCode;
            }
            Ok(Ok(Err(message))) => {
                let error = if message.to_lowercase().contains("cancel") {
                    OAuthError::cancelled(message)
                } else {
                    OAuthError::denied(message)
                };
                self.terminal(error);
            }
            Ok(Err(_)) => {
                self.terminal(OAuthError::cancelled("Authorization cancelled"));
            }
            Err(_) => {
                self.ctx.callbacks.cancel(&state).await;
                self.terminal(OAuthError::network(
                    "Timed out waiting for the authorization callback",
                ));
            }
        }
    }

    fn step_authorization_code(&mut self) {
        match self.code.as_deref() {
            Some(code) if !code.is_empty() => self.step = FlowStep::TokenRequest,
            _ => self.terminal(OAuthError::denied("Empty authorization code")),
        }
    }

    async fn step_token_request(&mut self) {
        let (Some(discovery), Some(client), Some(state), Some(code)) = (
            self.discovery.clone(),
            self.client.clone(),
            self.state_nonce.clone(),
            self.code.clone(),
        ) else {
            return self.terminal(OAuthError::metadata("Missing token-request context"));
        };

        let origin = match origin_of(&self.resource_url) {
            Ok(origin) => origin,
            Err(e) => return self.terminal(e),
        };

        // Recover the PKCE verifier; a missing session means the state
        // was never issued by us or has expired.
        let Some(session) = self.ctx.sessions.take(&origin, &state).await else {
            return self.terminal(OAuthError::state_mismatch(
                "No authorization session for this state (possible forgery or expiry)",
            ));
        };

        let result = exchange_code(
            &self.ctx.http,
            &discovery.server.token_endpoint,
            &client,
            &discovery.server.token_endpoint_auth_methods_supported,
            &code,
            &self.ctx.redirect_uri(),
            &session.verifier,
            session.resource.as_deref(),
        )
        .await;

        match result {
            Ok(tokens) => {
                if let Err(e) = self
                    .ctx
                    .credentials
                    .set_tokens(&self.backend_id, tokens.clone())
                    .await
                {
                    return self.terminal(OAuthError::network(format!(
                        "Failed to persist tokens: {e}"
                    )));
                }
                info!(backend = %self.backend_id, "Authorization complete");
                self.outcome = Some(Ok(tokens));
                self.step = FlowStep::Complete;
            }
            Err(e) => self.terminal(e),
        }
    }
}

/// Build the authorization URL.
#[allow(clippy::too_many_arguments)]
fn build_authorization_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
    resource: Option<&str>,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    if let Some(resource) = resource {
        url.push_str(&format!("&resource={}", urlencoding::encode(resource)));
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackParams;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_build_authorization_url() {
        let url = build_authorization_url(
            "https://auth.example.com/authorize",
            "client123",
            "http://localhost:8090/oauth/callback",
            Some("read tools"),
            "state123",
            "challenge123",
            Some("https://backend.test/mcp"),
        );

        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("scope=read%20tools"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("resource=https%3A%2F%2Fbackend.test%2Fmcp"));
    }

    #[test]
    fn test_build_authorization_url_existing_query() {
        let url = build_authorization_url(
            "https://auth.example.com/authorize?tenant=t1",
            "c",
            "r",
            None,
            "s",
            "ch",
            None,
        );
        assert!(url.contains("?tenant=t1&response_type=code"));
        assert!(!url.contains("scope="));
    }

    fn mock_provider_metadata(server_uri: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": server_uri,
            "authorization_endpoint": format!("{server_uri}/authorize"),
            "token_endpoint": format!("{server_uri}/token"),
            "registration_endpoint": format!("{server_uri}/register"),
            "scopes_supported": ["tools"],
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["none"]
        })
    }

    async fn mock_provider(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(mock_provider_metadata(&server.uri())),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "dyn-client"
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-flow",
                "refresh_token": "rt-flow",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
    }

    fn test_authorizer(callbacks: Arc<CallbackHub>) -> (tempfile::TempDir, Authorizer) {
        let dir = tempfile::tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::with_path(
            dir.path().join("credentials.json"),
        ));
        let authorizer = Authorizer::new(credentials, callbacks, 8090).without_browser();
        (dir, authorizer)
    }

    #[tokio::test]
    async fn test_full_flow_with_dynamic_registration() {
        let server = MockServer::start().await;
        mock_provider(&server).await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks.clone());
        let credentials = authorizer.credentials.clone();

        let resource_url = format!("{}/mcp", server.uri());
        let auth_task = {
            let authorizer = authorizer.clone();
            tokio::spawn(async move { authorizer.authorize("srv/a", &resource_url, None).await })
        };

        // Wait for the flow to reach the redirect step, then play the
        // provider redirect back through the hub.
        let state = loop {
            let states = callbacks.pending_states().await;
            if let Some(state) = states.first() {
                break state.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(callbacks
            .deliver(CallbackParams {
                code: Some("auth-code".to_string()),
                state: Some(state),
                error: None,
                error_description: None,
            })
            .await);

        let tokens = auth_task.await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "at-flow");

        // Tokens and the registered client were persisted.
        let stored = credentials.get_tokens("srv/a").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "at-flow");
        let client = credentials.get_client("srv/a").await.unwrap().unwrap();
        assert_eq!(client.client_id, "dyn-client");

        // The authorization session was consumed.
        assert!(authorizer.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_flow_static_client_skips_registration() {
        let server = MockServer::start().await;
        mock_provider(&server).await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks.clone());

        let static_client = ClientIdentity {
            client_id: "static-client".to_string(),
            client_secret: None,
            issued_at: None,
        };

        let resource_url = format!("{}/mcp", server.uri());
        let auth_task = {
            let authorizer = authorizer.clone();
            tokio::spawn(async move {
                authorizer
                    .authorize("srv/b", &resource_url, Some(static_client))
                    .await
            })
        };

        let state = loop {
            let states = callbacks.pending_states().await;
            if let Some(state) = states.first() {
                break state.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        callbacks
            .deliver(CallbackParams {
                code: Some("auth-code".to_string()),
                state: Some(state),
                error: None,
                error_description: None,
            })
            .await;

        assert!(auth_task.await.unwrap().is_ok());
        let client = authorizer
            .credentials
            .get_client("srv/b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.client_id, "static-client");
    }

    #[tokio::test]
    async fn test_flow_provider_denial() {
        let server = MockServer::start().await;
        mock_provider(&server).await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks.clone());

        let resource_url = format!("{}/mcp", server.uri());
        let auth_task = {
            let authorizer = authorizer.clone();
            tokio::spawn(async move { authorizer.authorize("srv/c", &resource_url, None).await })
        };

        let state = loop {
            let states = callbacks.pending_states().await;
            if let Some(state) = states.first() {
                break state.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        callbacks
            .deliver(CallbackParams {
                code: None,
                state: Some(state),
                error: Some("access_denied".to_string()),
                error_description: Some("User denied".to_string()),
            })
            .await;

        let err = auth_task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::Denied);
    }

    #[tokio::test]
    async fn test_flow_metadata_failure_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks);

        let result = authorizer
            .authorize("srv/d", &format!("{}/mcp", server.uri()), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_flow_callback_timeout() {
        let server = MockServer::start().await;
        mock_provider(&server).await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks.clone());
        let authorizer = authorizer.with_callback_timeout(Duration::from_millis(50));

        let err = authorizer
            .authorize("srv/e", &format!("{}/mcp", server.uri()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::Network);
        // The waiter was cleaned up.
        assert_eq!(callbacks.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(mock_provider_metadata(&server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-refreshed",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks);

        authorizer
            .credentials
            .set_tokens(
                "srv/f",
                TokenRecord {
                    access_token: "at-old".to_string(),
                    refresh_token: Some("rt-old".to_string()),
                    expires_at: Some(1),
                    scope: None,
                },
            )
            .await
            .unwrap();
        authorizer
            .credentials
            .set_client(
                "srv/f",
                ClientIdentity {
                    client_id: "client".to_string(),
                    client_secret: None,
                    issued_at: None,
                },
            )
            .await
            .unwrap();

        assert!(authorizer.refresh("srv/f", &format!("{}/mcp", server.uri())).await);
        let stored = authorizer
            .credentials
            .get_tokens("srv/f")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "at-refreshed");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt-old"));
    }

    #[tokio::test]
    async fn test_refresh_without_stored_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(mock_provider_metadata(&server.uri())),
            )
            .mount(&server)
            .await;

        let callbacks = Arc::new(CallbackHub::new());
        let (_dir, authorizer) = test_authorizer(callbacks);
        assert!(!authorizer.refresh("srv/none", &format!("{}/mcp", server.uri())).await);
    }
}
