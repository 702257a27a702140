//! HTTP API server for the Empath gateway

pub mod health;
pub mod voice;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use voice::ApiError;

use crate::pipeline::Pipeline;
use crate::session::SessionManager;
use crate::Result;

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub pipeline: Pipeline,
}

impl ApiState {
    #[must_use]
    pub const fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Session manager
    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        self.pipeline.sessions()
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    pipeline: Pipeline,
    host: String,
    port: u16,
    max_body_bytes: usize,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_body_bytes: 20 * 1024 * 1024,
        }
    }

    /// Set the bind address
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listen port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Cap request bodies (audio uploads)
    #[must_use]
    pub const fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState::new(self.pipeline)),
            host: self.host,
            port: self.port,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    max_body_bytes: usize,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state), self.max_body_bytes)
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Build the full router over `state`
pub fn build_router(state: Arc<ApiState>, max_body_bytes: usize) -> Router {
    let router = Router::new()
        .nest("/api", voice::router(Arc::clone(&state)))
        .nest("/ws", websocket::router(state))
        .merge(health::router());

    // CORS layer for cross-origin requests from the browser client
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    router
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
