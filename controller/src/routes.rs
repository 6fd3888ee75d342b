//! HTTP route handlers for the controller API.

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;

use crate::state::{AppState, ControllerStatus};

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - activity counters and the most recent report.
async fn status(State(state): State<AppState>) -> Json<ControllerStatus> {
    Json(state.status.read().await.clone())
}
