//! Health Check API Handler
//!
//! Health check endpoint for monitoring.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::api::AppState;

/// GET /health
/// Reports the number of runs with a live controller
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "active_runs": state.engine.active_count(),
        })),
    )
}
