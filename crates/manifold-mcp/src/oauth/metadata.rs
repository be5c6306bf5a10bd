//! OAuth metadata discovery.
//!
//! Finds the authorization server for a backend resource and validates
//! that it advertises everything the PKCE authorization-code flow needs.

use super::OAuthError;
use serde::Deserialize;
use tracing::{debug, warn};

/// Well-known path for protected-resource metadata (RFC 9728).
const RESOURCE_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";

/// Well-known paths tried for authorization-server metadata.
const SERVER_WELL_KNOWN: [&str; 2] = [
    "/.well-known/oauth-authorization-server",
    "/.well-known/openid-configuration",
];

/// Protected-resource metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Authorization-server metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl ServerMetadata {
    /// Validate that the server can drive the PKCE code flow.
    fn validate(&self) -> Result<(), OAuthError> {
        if self.authorization_endpoint.is_empty() {
            return Err(OAuthError::metadata(
                "Authorization server metadata is missing an authorization endpoint",
            ));
        }
        if self.token_endpoint.is_empty() {
            return Err(OAuthError::metadata(
                "Authorization server metadata is missing a token endpoint",
            ));
        }
        if !self
            .code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
        {
            return Err(OAuthError::metadata(
                "Authorization server does not advertise the S256 PKCE method",
            ));
        }
        if !self.response_types_supported.iter().any(|r| r == "code") {
            return Err(OAuthError::metadata(
                "Authorization server does not advertise the code response type",
            ));
        }
        Ok(())
    }
}

/// The result of metadata discovery for one backend.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Protected-resource metadata, when the resource publishes one.
    pub resource: Option<ResourceMetadata>,
    /// Validated authorization-server metadata.
    pub server: ServerMetadata,
    /// Union of the scopes advertised by resource and server.
    pub scopes: Option<String>,
}

/// Extract `scheme://host[:port]` from a URL.
pub fn origin_of(raw: &str) -> Result<String, OAuthError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| OAuthError::metadata(format!("Invalid resource URL {raw}: {e}")))?;
    let origin = parsed.origin();
    if !matches!(origin, url::Origin::Tuple(..)) {
        return Err(OAuthError::metadata(format!(
            "Resource URL {raw} has no usable origin"
        )));
    }
    Ok(origin.ascii_serialization())
}

/// Fetch protected-resource metadata; absence is not an error.
async fn fetch_resource_metadata(
    http: &reqwest::Client,
    resource_origin: &str,
) -> Option<ResourceMetadata> {
    let url = format!("{resource_origin}{RESOURCE_WELL_KNOWN}");
    match http.get(&url).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(metadata) => {
                debug!(url = %url, "Fetched protected-resource metadata");
                Some(metadata)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Malformed protected-resource metadata");
                None
            }
        },
        Ok(response) => {
            debug!(url = %url, status = %response.status(), "No protected-resource metadata");
            None
        }
        Err(e) => {
            debug!(url = %url, error = %e, "Protected-resource metadata fetch failed");
            None
        }
    }
}

/// Fetch authorization-server metadata from the two well-known paths.
async fn fetch_server_metadata(
    http: &reqwest::Client,
    server_origin: &str,
) -> Result<ServerMetadata, OAuthError> {
    let mut last_error = None;
    for path in SERVER_WELL_KNOWN {
        let url = format!("{server_origin}{path}");
        match http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let metadata: ServerMetadata = response.json().await.map_err(|e| {
                    OAuthError::metadata(format!("Malformed authorization-server metadata: {e}"))
                })?;
                debug!(url = %url, "Fetched authorization-server metadata");
                return Ok(metadata);
            }
            Ok(response) => {
                last_error = Some(OAuthError::metadata(format!(
                    "Metadata endpoint {url} returned {}",
                    response.status()
                )));
            }
            Err(e) => {
                last_error = Some(OAuthError::network(format!(
                    "Failed to fetch {url}: {e}"
                )));
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| OAuthError::metadata("No authorization-server metadata found")))
}

/// Discover and validate the authorization server for a backend resource.
pub async fn discover(http: &reqwest::Client, resource_url: &str) -> Result<Discovery, OAuthError> {
    let resource_origin = origin_of(resource_url)?;

    let resource = fetch_resource_metadata(http, &resource_origin).await;

    // Default to the resource's own origin when it names no server.
    let server_url = resource
        .as_ref()
        .and_then(|m| m.authorization_servers.first().cloned())
        .unwrap_or_else(|| resource_origin.clone());
    let server_origin = origin_of(&server_url)?;

    let server = fetch_server_metadata(http, &server_origin).await?;
    server.validate()?;

    let mut scopes: Vec<String> = Vec::new();
    if let Some(ref resource) = resource {
        scopes.extend(resource.scopes_supported.iter().cloned());
    }
    for scope in &server.scopes_supported {
        if !scopes.contains(scope) {
            scopes.push(scope.clone());
        }
    }
    let scopes = if scopes.is_empty() {
        None
    } else {
        Some(scopes.join(" "))
    };

    Ok(Discovery {
        resource,
        server,
        scopes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server_metadata_body(origin: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": origin,
            "authorization_endpoint": format!("{origin}/authorize"),
            "token_endpoint": format!("{origin}/token"),
            "registration_endpoint": format!("{origin}/register"),
            "scopes_supported": ["tools"],
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["client_secret_basic", "none"]
        })
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://mcp.example.com/v1/mcp").unwrap(),
            "https://mcp.example.com"
        );
        assert_eq!(
            origin_of("http://localhost:8080/sse").unwrap(),
            "http://localhost:8080"
        );
        assert!(origin_of("not a url").is_err());
    }

    #[tokio::test]
    async fn test_discover_without_resource_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata_body(&server.uri())))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let discovery = discover(&http, &format!("{}/mcp", server.uri()))
            .await
            .unwrap();
        assert!(discovery.resource.is_none());
        assert!(discovery.server.authorization_endpoint.ends_with("/authorize"));
        assert_eq!(discovery.scopes.as_deref(), Some("tools"));
    }

    #[tokio::test]
    async fn test_discover_with_resource_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource": format!("{}/mcp", server.uri()),
                "authorization_servers": [server.uri()],
                "scopes_supported": ["read", "tools"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata_body(&server.uri())))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let discovery = discover(&http, &format!("{}/mcp", server.uri()))
            .await
            .unwrap();
        assert!(discovery.resource.is_some());
        // Union without duplicates, resource scopes first.
        assert_eq!(discovery.scopes.as_deref(), Some("read tools"));
    }

    #[tokio::test]
    async fn test_discover_falls_back_to_openid_configuration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata_body(&server.uri())))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let discovery = discover(&http, &format!("{}/mcp", server.uri())).await;
        assert!(discovery.is_ok());
    }

    #[tokio::test]
    async fn test_missing_s256_is_terminal() {
        let server = MockServer::start().await;
        let mut body = server_metadata_body(&server.uri());
        body["code_challenge_methods_supported"] = serde_json::json!(["plain"]);
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = discover(&http, &format!("{}/mcp", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::oauth::OAuthErrorKind::Metadata);
        assert!(!err.recoverable);
        assert!(err.message.contains("S256"));
    }

    #[tokio::test]
    async fn test_missing_code_response_type_is_terminal() {
        let server = MockServer::start().await;
        let mut body = server_metadata_body(&server.uri());
        body["response_types_supported"] = serde_json::json!(["token"]);
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = discover(&http, &format!("{}/mcp", server.uri()))
            .await
            .unwrap_err();
        assert!(err.message.contains("code response type"));
    }

    #[tokio::test]
    async fn test_no_metadata_anywhere() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let result = discover(&http, &format!("{}/mcp", server.uri())).await;
        assert!(result.is_err());
    }
}
