use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use quern::protocol::HealthResponse;

use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<HealthResponse> {
    let loaded = state.coordinator.is_loaded();
    let pool = state.coordinator.pool_status();
    // A pool that lost contexts still serves requests at reduced
    // concurrency.
    let status = if !loaded {
        "unavailable"
    } else if pool.capacity < pool.pool_size {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        model_loaded: loaded,
        model_name: loaded.then(|| state.coordinator.model_name().to_string()),
    })
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/health", get(health))
        .with_state(state)
}
