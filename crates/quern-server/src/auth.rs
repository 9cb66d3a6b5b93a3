//! API key authentication for the completion endpoint.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::routes::errors::ErrorResponse;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Reject requests without a valid `X-API-Key` header. A no-op when
/// security is disabled in the configuration.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    if !state.settings.security.enabled {
        return Ok(next.run(request).await);
    }

    let Some(expected) = state.settings.security.api_key.as_deref() else {
        tracing::error!("security is enabled but no API key is configured");
        return Err(ErrorResponse::internal(
            "API key is not configured on server",
        ));
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    match provided {
        None => Err(ErrorResponse::unauthorized("API key is missing")),
        Some(provided) if keys_match(provided, expected) => Ok(next.run(request).await),
        Some(_) => Err(ErrorResponse::unauthorized("Invalid API key")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_requires_exact_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secret2"));
        assert!(!keys_match("", "secret"));
        assert!(!keys_match("Secret", "secret"));
    }
}
