use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quern::GenerateError;
use serde_json::json;

/// JSON error body with an HTTP status, usable both as a handler return
/// and from middleware.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<GenerateError> for ErrorResponse {
    fn from(e: GenerateError) -> Self {
        let status = match &e {
            GenerateError::NotReady
            | GenerateError::PoolExhausted { .. }
            | GenerateError::Initialization(_) => StatusCode::SERVICE_UNAVAILABLE,
            GenerateError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
