//! The unified gateway endpoint.
//!
//! Exposes `POST/GET/DELETE /mcp`, profile-scoped variants under
//! `/{profile_id}/mcp`, the OAuth redirect callback and a health probe.
//! Session identity travels in the `mcp-session-id` header; every
//! failure leaves the handler as a JSON-RPC shaped error, never a bare
//! transport error.

use crate::session::Session;
use crate::state::GatewayState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use manifold_mcp::callback::{html_error, CallbackParams, HTML_SUCCESS};
use manifold_mcp::protocol::{
    CallToolParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolCallResult, ToolContent, ToolsCapability,
    PROTOCOL_VERSION,
};
use manifold_mcp::{McpError, SESSION_ID_HEADER};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Missing or unknown session id on a non-initialize request.
const CODE_BAD_SESSION: i64 = -32000;
/// Profile scoping is not enabled.
const CODE_PROFILES_DISABLED: i64 = -32001;
/// The named profile does not exist.
const CODE_PROFILE_MISSING: i64 = -32002;

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/mcp",
            get(get_default).post(post_default).delete(delete_default),
        )
        .route(
            "/{profile_id}/mcp",
            get(get_profile).post(post_profile).delete(delete_profile),
        )
        .route("/oauth/callback", get(oauth_callback))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// POST: JSON-RPC requests
// ============================================================================

async fn post_default(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    handle_post(state, None, headers, request).await
}

async fn post_profile(
    State(state): State<GatewayState>,
    Path(profile_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    handle_post(state, Some(profile_id), headers, request).await
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn bad_session_response(request_id: Option<u64>) -> Response {
    let rpc = JsonRpcResponse::failure(
        request_id.unwrap_or(0),
        CODE_BAD_SESSION,
        "Bad Request: missing or unknown session id",
        None,
    );
    (StatusCode::BAD_REQUEST, Json(rpc)).into_response()
}

fn profile_error_response(code: i64, message: String, profile_id: &str) -> Response {
    let rpc = JsonRpcResponse::failure(
        0,
        code,
        message,
        Some(serde_json::json!({ "profileId": profile_id })),
    );
    (StatusCode::NOT_FOUND, Json(rpc)).into_response()
}

/// Resolve the backend scope for an optional profile id.
async fn resolve_scope(
    state: &GatewayState,
    profile_id: Option<&str>,
) -> Result<Option<Vec<String>>, Response> {
    let Some(profile_id) = profile_id else {
        return Ok(None);
    };
    if !state.config.profiles_enabled().await {
        return Err(profile_error_response(
            CODE_PROFILES_DISABLED,
            "Profile scoping is not enabled".to_string(),
            profile_id,
        ));
    }
    match state.config.profile(profile_id).await {
        Some(profile) => Ok(Some(profile.backend_ids)),
        None => Err(profile_error_response(
            CODE_PROFILE_MISSING,
            format!("Unknown profile: {profile_id}"),
            profile_id,
        )),
    }
}

fn gateway_initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            resources: None,
            prompts: None,
        },
        server_info: ServerInfo {
            name: "manifold".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
    }
}

async fn handle_post(
    state: GatewayState,
    profile_id: Option<String>,
    headers: HeaderMap,
    request: JsonRpcRequest,
) -> Response {
    let session_id = session_header(&headers);

    // A fresh handshake creates the session.
    if request.method == "initialize" && session_id.is_none() {
        let scope = match resolve_scope(&state, profile_id.as_deref()).await {
            Ok(scope) => scope,
            Err(response) => return response,
        };

        let session_id = state.sessions.create(profile_id, scope).await;
        let rpc = match serde_json::to_value(gateway_initialize_result()) {
            Ok(result) => JsonRpcResponse::success(request.id.unwrap_or(0), result),
            Err(e) => JsonRpcResponse::failure(
                request.id.unwrap_or(0),
                -32603,
                format!("Internal error: {e}"),
                None,
            ),
        };

        let mut response = (StatusCode::OK, Json(rpc)).into_response();
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
        return response;
    }

    // Everything else requires a known session.
    let Some(session_id) = session_id else {
        return bad_session_response(request.id);
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        return bad_session_response(request.id);
    };

    if request.is_notification() {
        debug!(method = %request.method, "Notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }
    let request_id = request.id.unwrap_or(0);

    let rpc = match request.method.as_str() {
        "initialize" => match serde_json::to_value(gateway_initialize_result()) {
            Ok(result) => JsonRpcResponse::success(request_id, result),
            Err(e) => JsonRpcResponse::failure(request_id, -32603, e.to_string(), None),
        },
        "ping" => JsonRpcResponse::success(request_id, serde_json::json!({})),
        "tools/list" => {
            let tools = state
                .registry
                .list_tools(session.scope.as_deref())
                .await;
            match serde_json::to_value(ListToolsResult { tools }) {
                Ok(result) => JsonRpcResponse::success(request_id, result),
                Err(e) => JsonRpcResponse::failure(request_id, -32603, e.to_string(), None),
            }
        }
        "tools/call" => handle_tool_call(&state, &session, request_id, request.params).await,
        other => {
            JsonRpcResponse::failure(request_id, -32601, format!("Method not found: {other}"), None)
        }
    };

    (StatusCode::OK, Json(rpc)).into_response()
}

async fn handle_tool_call(
    state: &GatewayState,
    session: &Arc<Session>,
    request_id: u64,
    params: Option<serde_json::Value>,
) -> JsonRpcResponse {
    let params: CallToolParams = match params {
        Some(params) => match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::failure(
                    request_id,
                    -32602,
                    format!("Invalid params: {e}"),
                    None,
                )
            }
        },
        None => {
            return JsonRpcResponse::failure(request_id, -32602, "Missing params", None);
        }
    };

    let arguments = params
        .arguments
        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

    let result = state
        .registry
        .dispatch(&params.name, arguments, session.scope.as_deref())
        .await;

    match result {
        Ok(result) => match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(request_id, value),
            Err(e) => JsonRpcResponse::failure(request_id, -32603, e.to_string(), None),
        },
        Err(McpError::ToolNotFound(name)) => {
            JsonRpcResponse::failure(request_id, -32602, format!("Unknown tool: {name}"), None)
        }
        Err(McpError::InvalidArguments(message)) => {
            JsonRpcResponse::failure(request_id, -32602, message, None)
        }
        Err(e) => {
            // Backend-raised failures travel back as tool results; the
            // call itself completed at the protocol level.
            warn!(tool = %params.name, error = %e, "Tool call failed");
            let result = ToolCallResult {
                content: vec![ToolContent::Text {
                    text: e.to_string(),
                }],
                is_error: true,
            };
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(request_id, value),
                Err(e) => JsonRpcResponse::failure(request_id, -32603, e.to_string(), None),
            }
        }
    }
}

// ============================================================================
// GET: server-to-client stream
// ============================================================================

/// Removes the session when the client's stream goes away.
struct SessionCloseGuard {
    sessions: Arc<crate::session::SessionMap>,
    session_id: String,
}

impl Drop for SessionCloseGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sessions.remove(&session_id).await;
            });
        }
    }
}

async fn get_default(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    handle_get(state, headers).await
}

async fn get_profile(
    State(state): State<GatewayState>,
    Path(_profile_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    handle_get(state, headers).await
}

async fn handle_get(state: GatewayState, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return bad_session_response(None);
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        return bad_session_response(None);
    };
    let Some(mut rx) = session.take_stream().await else {
        return bad_session_response(None);
    };

    info!(session_id = %session_id, "Session stream opened");

    let guard = SessionCloseGuard {
        sessions: state.sessions.clone(),
        session_id,
    };

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(async_stream::stream! {
            // Owned by the stream so client disconnect tears the session
            // down.
            let _guard = guard;
            while let Some(response) = rx.recv().await {
                if let Ok(data) = serde_json::to_string(&response) {
                    yield Ok(Event::default().event("message").data(data));
                }
            }
        });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

// ============================================================================
// DELETE: explicit session termination
// ============================================================================

async fn delete_default(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    handle_delete(state, headers).await
}

async fn delete_profile(
    State(state): State<GatewayState>,
    Path(_profile_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    handle_delete(state, headers).await
}

async fn handle_delete(state: GatewayState, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return bad_session_response(None);
    };
    if !state.sessions.remove(&session_id).await {
        return bad_session_response(None);
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "terminated" })),
    )
        .into_response()
}

// ============================================================================
// OAuth callback
// ============================================================================

async fn oauth_callback(
    State(state): State<GatewayState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = CallbackParams {
        code: query.get("code").cloned(),
        state: query.get("state").cloned(),
        error: query.get("error").cloned(),
        error_description: query.get("error_description").cloned(),
    };

    if params.state.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Html(html_error(
                "Missing required state parameter - potential CSRF attack",
            )),
        )
            .into_response();
    }

    let provider_error = params
        .error_description
        .clone()
        .or_else(|| params.error.clone());
    let delivered = state.callbacks.deliver(params).await;

    match (delivered, provider_error) {
        (true, None) => (StatusCode::OK, Html(HTML_SUCCESS.to_string())).into_response(),
        (true, Some(error)) => (StatusCode::OK, Html(html_error(&error))).into_response(),
        (false, _) => (
            StatusCode::BAD_REQUEST,
            Html(html_error(
                "Invalid or expired state parameter - potential CSRF attack",
            )),
        )
            .into_response(),
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<GatewayState>) -> Response {
    (StatusCode::OK, Json(state.health().await)).into_response()
}
