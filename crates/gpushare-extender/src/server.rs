use crate::handlers::*;
use crate::{ApiError, AppState, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Extender server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to listen on
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8888)),
        }
    }
}

/// Extender server
pub struct ApiServer {
    config: Config,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new extender server
    pub fn new(config: Config, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Build the router
    pub(crate) fn build_router(&self) -> Router {
        Router::new()
            // Health checks
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            // Extender verbs
            .route("/filter", post(filter))
            .route("/bind", post(bind))
            // Inspection
            .route("/nodes", get(list_nodes))
            .route("/nodes/{name}", get(get_node))
            .route("/pods", get(list_pods))
            // Add tracing and state
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the server
    pub async fn run(self) -> std::result::Result<(), std::io::Error> {
        let app = self.build_router();

        info!("Starting extender server on {}", self.config.listen_addr);

        let listener = TcpListener::bind(self.config.listen_addr).await?;

        axum::serve(listener, app).await
    }
}

/// Health check endpoint
async fn healthz() -> &'static str {
    "ok"
}

/// Readiness probe, ready once nodes have been registered
async fn readyz(State(state): State<Arc<AppState>>) -> Result<&'static str> {
    if state.is_ready() {
        Ok("ok")
    } else {
        Err(ApiError::Unavailable(
            "node registration has not completed".to_string(),
        ))
    }
}
