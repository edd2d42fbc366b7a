//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Session control routes (start, stop, list, get)
//! - Health check
//! - WebSocket subscriber endpoint

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let detector_ok = state.detector.health_check().await;

    let response = HealthResponse {
        status: if detector_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        detector_connected: detector_ok,
        active_sessions: state.registry.running_count().await,
        uptime_seconds: state.uptime().as_secs(),
    };

    Json(response)
}
