//! Token endpoint operations: authorization-code exchange and refresh.

use super::OAuthError;
use base64::{engine::general_purpose::STANDARD, Engine};
use manifold_credentials::{now_epoch_secs, ClientIdentity, TokenRecord};
use serde::Deserialize;
use tracing::{debug, warn};

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// HTTP basic auth with client id and secret.
    Basic,
    /// Secret in the form body.
    Post,
    /// Public client, no secret.
    None,
}

/// Choose the client authentication method.
///
/// Preference order is `client_secret_basic` > `client_secret_post` >
/// `none`, constrained to what the server advertises. A public client
/// without a secret must use `none` regardless of advertisement.
pub fn select_client_auth(advertised: &[String], has_secret: bool) -> ClientAuth {
    if !has_secret {
        return ClientAuth::None;
    }
    if advertised.is_empty() {
        // No advertisement defaults to basic per RFC 8414.
        return ClientAuth::Basic;
    }
    if advertised.iter().any(|m| m == "client_secret_basic") {
        ClientAuth::Basic
    } else if advertised.iter().any(|m| m == "client_secret_post") {
        ClientAuth::Post
    } else {
        ClientAuth::None
    }
}

fn categorize_token_error(status: reqwest::StatusCode, body: &str) -> OAuthError {
    // RFC 6749 error codes, used for presentation only.
    if body.contains("invalid_client") || body.contains("unauthorized_client") {
        OAuthError::invalid_client(format!("Token endpoint rejected the client: {body}"))
    } else if body.contains("invalid_scope") {
        OAuthError::invalid_scope(format!("Token endpoint rejected the scope: {body}"))
    } else if body.contains("access_denied") {
        OAuthError::denied(format!("Token endpoint denied the request: {body}"))
    } else {
        OAuthError::denied(format!("Token request failed with {status}: {body}"))
    }
}

async fn post_token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &ClientIdentity,
    advertised: &[String],
    mut params: Vec<(&str, String)>,
) -> Result<TokenResponse, OAuthError> {
    let auth = select_client_auth(advertised, client.client_secret.is_some());

    params.push(("client_id", client.client_id.clone()));
    let mut request = http.post(token_endpoint);
    match auth {
        ClientAuth::Basic => {
            let secret = client.client_secret.as_deref().unwrap_or_default();
            let credentials = STANDARD.encode(format!("{}:{secret}", client.client_id));
            request = request.header("Authorization", format!("Basic {credentials}"));
        }
        ClientAuth::Post => {
            if let Some(ref secret) = client.client_secret {
                params.push(("client_secret", secret.clone()));
            }
        }
        ClientAuth::None => {}
    }

    let response = request
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::network(format!("Token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(categorize_token_error(status, &body));
    }

    response
        .json()
        .await
        .map_err(|e| OAuthError::denied(format!("Malformed token response: {e}")))
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &ClientIdentity,
    advertised: &[String],
    code: &str,
    redirect_uri: &str,
    verifier: &str,
    resource: Option<&str>,
) -> Result<TokenRecord, OAuthError> {
    let mut params = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("code_verifier", verifier.to_string()),
    ];
    if let Some(resource) = resource {
        params.push(("resource", resource.to_string()));
    }

    let tokens = post_token_request(http, token_endpoint, client, advertised, params).await?;
    debug!("Exchanged authorization code for tokens");

    Ok(TokenRecord {
        expires_at: tokens.expires_in.map(|secs| now_epoch_secs() + secs),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        scope: tokens.scope,
    })
}

/// Refresh tokens with a `refresh_token` grant.
///
/// Returns `None` when the refresh did not happen, so the caller can
/// decide fallback behavior; never propagates an error.
pub async fn refresh_grant(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &ClientIdentity,
    advertised: &[String],
    previous: &TokenRecord,
) -> Option<TokenRecord> {
    let refresh_token = match previous.refresh_token {
        Some(ref token) => token.clone(),
        None => {
            debug!("No refresh token stored, skipping refresh");
            return None;
        }
    };

    let params = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.clone()),
    ];

    match post_token_request(http, token_endpoint, client, advertised, params).await {
        Ok(tokens) => Some(TokenRecord {
            expires_at: tokens.expires_in.map(|secs| now_epoch_secs() + secs),
            access_token: tokens.access_token,
            // Keep the previous refresh token when the response omits one.
            refresh_token: tokens.refresh_token.or(Some(refresh_token)),
            scope: tokens.scope.or_else(|| previous.scope.clone()),
        }),
        Err(e) => {
            warn!(error = %e, "Token refresh failed");
            None
        }
    }
}
