//! Readiness probe.

use axum::extract::State;
use axum::Json;

use super::types::HealthResponse;
use super::AppState;

/// GET /health: current lifecycle status plus model load progress.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.health.status().as_str(),
        progress: state.health.progress(),
    })
}
