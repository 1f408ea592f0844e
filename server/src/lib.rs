//! unframe HTTP server.
//!
//! Exposes the proxy pipeline as a JSON endpoint (`POST /web-proxy` by
//! default) with permissive CORS, plus `GET /health`.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod error;
pub mod handlers;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use unframe_config::{ServerConfig, UnframeConfig};

pub use error::{AppError, AppResult};
pub use state::AppState;

/// Run the server until `shutdown` resolves, then drain in-flight requests.
pub async fn run_with_shutdown<F>(config: UnframeConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let server = config.server_config();
    let state = Arc::new(AppState::new(&config.proxy_config())?);
    let app = create_router(state, &server)?;

    let addr: SocketAddr = server.listen_addr().parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Starting unframe on {} (route {})", addr, server.route());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Create the application router. Fails if the configured route is not a
/// plain static path.
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> anyhow::Result<Router> {
    let route = checked_route(server)?;
    Ok(Router::new()
        .route(&route, post(handlers::web_proxy).options(handlers::preflight))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(server.max_body_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state))
}

/// Only unreserved URL characters, so the route never reaches axum's path
/// parser as a capture or wildcard.
fn checked_route(server: &ServerConfig) -> anyhow::Result<String> {
    let route = server.route();
    let valid = route.len() > 1
        && route
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '.' | '_' | '~'))
        && !route.contains("//");
    if !valid {
        anyhow::bail!(
            "invalid server.route {route:?}: expected a static path such as \"/web-proxy\""
        );
    }
    if route == "/health" {
        anyhow::bail!("invalid server.route {route:?}: reserved for the health check");
    }
    Ok(route)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            CONTENT_TYPE,
        ])
}
