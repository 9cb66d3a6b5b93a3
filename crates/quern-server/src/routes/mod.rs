pub mod chat;
pub mod errors;
pub mod health;
pub mod models;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware};
use utoipa::OpenApi;

use crate::openapi::ApiDoc;
use crate::state::AppState;

pub fn configure(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(health::routes(state.clone()))
        .merge(models::routes(state))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(middleware::from_fn(crate::logging::log_requests))
}
