use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use quern::protocol::ModelsListResponse;

use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, description = "Available models", body = ModelsListResponse))
)]
pub async fn list_models(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<ModelsListResponse> {
    Json(ModelsListResponse::single(state.coordinator.model_name()))
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .with_state(state)
}
