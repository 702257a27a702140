//! Service banner and health check endpoints

use axum::{Json, Router, routing::get};
use serde::Serialize;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Service banner
#[derive(Serialize)]
pub struct BannerResponse {
    pub message: &'static str,
}

/// Root endpoint
async fn banner() -> Json<BannerResponse> {
    Json(BannerResponse {
        message: "EmpathAI voice gateway is running",
    })
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build health router
pub fn router() -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
}
