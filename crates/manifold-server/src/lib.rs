//! Gateway server for manifold.
//!
//! Exposes the unified MCP endpoint over HTTP: one logical session per
//! client handshake, optional profile-scoped routes, the aggregated tool
//! registry with usage accounting, and the OAuth redirect callback the
//! authorization subsystem waits on.
//!
//! # Endpoints
//!
//! - `POST/GET/DELETE /mcp` - the unified endpoint (all enabled backends)
//! - `POST/GET/DELETE /{profile_id}/mcp` - profile-scoped variant
//! - `GET /oauth/callback` - OAuth redirect delivery
//! - `GET /health` - liveness and backend count

mod registry;
mod routes;
mod session;
mod state;

pub use registry::{ToolRegistry, UsageEvent};
pub use routes::router;
pub use session::{Session, SessionMap};
pub use state::{GatewayState, Health};

use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

/// Serve the gateway until `shutdown` resolves.
pub async fn serve(
    state: GatewayState,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let refresher = state.spawn_catalog_refresher();
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Gateway listening");

    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    refresher.abort();
    result
}
