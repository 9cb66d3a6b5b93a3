//! The `/v1/chat/completions` endpoint.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router, middleware};
use bytes::Bytes;
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;

use quern::protocol::{ChatCompletionRequest, ChatCompletionResponse};

use crate::auth::require_api_key;
use crate::routes::errors::ErrorResponse;
use crate::state::AppState;

/// `text/event-stream` response backed by the coordinator's frame channel.
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);

        http::Response::builder()
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(body)
            .unwrap()
    }
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Chat completion or SSE stream", body = ChatCompletionResponse),
        (status = 401, description = "Missing or invalid API key"),
        (status = 503, description = "Service not ready or at capacity"),
        (status = 500, description = "Generation failed")
    )
)]
pub async fn chat_completions(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ErrorResponse> {
    if request.messages.is_empty() {
        return Err(ErrorResponse {
            status: StatusCode::BAD_REQUEST,
            message: "messages must not be empty".to_string(),
        });
    }

    if request.stream {
        let frames = state.coordinator.complete_stream(request).await?;
        Ok(SseResponse::new(frames).into_response())
    } else {
        let response = state.coordinator.complete(request).await?;
        Ok(Json(response).into_response())
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}
