//! Stateless relay between chat clients and the completion provider.

pub mod error;
pub mod handlers;
pub mod normalize;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::providers::{CompletionProvider, OpenRouterProvider};

pub use types::{RelayReply, RelayRequest};

/// Per-process handles; every request gets its own upstream connection.
#[derive(Clone)]
pub struct RelayState {
    pub provider: Arc<dyn CompletionProvider>,
    pub config: Arc<RelayConfig>,
}

pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: RelayConfig) -> Result<()> {
    if config.api_key().is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; chat requests will fail");
    }

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind, config.port))?;

    let state = RelayState {
        provider: Arc::new(OpenRouterProvider::new(&config)),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Relay listening on http://{}", addr);

    axum::serve(listener, router(state))
        .await
        .context("Relay server stopped")
}
