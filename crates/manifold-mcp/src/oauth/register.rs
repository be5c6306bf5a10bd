//! Dynamic client registration (RFC 7591).

use super::{OAuthError, ServerMetadata};
use manifold_credentials::ClientIdentity;
use serde::Deserialize;
use tracing::info;

/// The redirect URI registered with every backend.
pub fn redirect_uri_for_port(port: u16) -> String {
    format!("http://localhost:{port}/oauth/callback")
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    client_id_issued_at: Option<u64>,
}

/// Register a new client with the authorization server.
pub async fn register_client(
    http: &reqwest::Client,
    server: &ServerMetadata,
    redirect_uri: &str,
    scopes: Option<&str>,
) -> Result<ClientIdentity, OAuthError> {
    let endpoint = server
        .registration_endpoint
        .as_deref()
        .ok_or_else(|| {
            OAuthError::invalid_client(
                "No client identity configured and the server does not support registration",
            )
        })?;

    let mut body = serde_json::json!({
        "client_name": "Manifold",
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });
    if let Some(scopes) = scopes {
        body["scope"] = serde_json::json!(scopes);
    }

    let response = http
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| OAuthError::network(format!("Client registration failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(OAuthError::invalid_client(format!(
            "Client registration returned {status}: {text}"
        )));
    }

    let registered: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| OAuthError::invalid_client(format!("Malformed registration response: {e}")))?;

    info!(client_id = %registered.client_id, "Registered OAuth client");

    Ok(ClientIdentity {
        client_id: registered.client_id,
        client_secret: registered.client_secret,
        issued_at: registered.client_id_issued_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_redirect_uri() {
        assert_eq!(
            redirect_uri_for_port(8090),
            "http://localhost:8090/oauth/callback"
        );
    }

    fn server_with_registration(endpoint: String) -> ServerMetadata {
        ServerMetadata {
            registration_endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_registration_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(body_partial_json(serde_json::json!({
                "grant_types": ["authorization_code", "refresh_token"],
                "redirect_uris": ["http://localhost:8090/oauth/callback"],
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "dyn-client-1",
                "client_secret": "dyn-secret",
                "client_id_issued_at": 1_700_000_000
            })))
            .mount(&server)
            .await;

        let metadata = server_with_registration(format!("{}/register", server.uri()));
        let http = reqwest::Client::new();
        let identity = register_client(
            &http,
            &metadata,
            "http://localhost:8090/oauth/callback",
            Some("tools"),
        )
        .await
        .unwrap();

        assert_eq!(identity.client_id, "dyn-client-1");
        assert_eq!(identity.client_secret.as_deref(), Some("dyn-secret"));
        assert_eq!(identity.issued_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_no_registration_endpoint() {
        let http = reqwest::Client::new();
        let err = register_client(
            &http,
            &ServerMetadata::default(),
            "http://localhost:8090/oauth/callback",
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::InvalidClient);
    }

    #[tokio::test]
    async fn test_registration_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_redirect_uri"))
            .mount(&server)
            .await;

        let metadata = server_with_registration(format!("{}/register", server.uri()));
        let http = reqwest::Client::new();
        let err = register_client(&http, &metadata, "bad", None)
            .await
            .unwrap_err();
        assert!(err.message.contains("400"));
    }
}
