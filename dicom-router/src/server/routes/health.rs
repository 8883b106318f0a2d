//! Health check routes.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::AdminState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub pipelines: usize,
}

/// Create the health router.
pub fn router() -> Router<AdminState> {
    Router::new().route("/", get(health_check))
}

/// Liveness: answers as long as the process serves requests.
async fn health_check(State(state): State<AdminState>) -> Json<HealthResponse> {
    let context = &state.context;
    let running = context.pipelines().iter().filter(|p| !p.is_down()).count();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: context.uptime().as_secs(),
        pipelines: running,
    })
}
