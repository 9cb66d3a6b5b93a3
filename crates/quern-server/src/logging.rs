//! Tracing setup and per-request logging.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Install the global subscriber. `RUST_LOG` overrides the default level.
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quern=debug,quern_server=debug")),
        )
        .init();
}

/// Log every request with a correlating id, the outcome status and the
/// wall-clock time spent in the handler.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().simple().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    tracing::debug!(%request_id, %method, %uri, "request started");
    let response = next.run(request).await;
    let elapsed_ms = start.elapsed().as_millis();
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(%request_id, %method, %uri, %status, elapsed_ms, "request failed");
    } else {
        tracing::info!(%request_id, %method, %uri, %status, elapsed_ms, "request completed");
    }
    response
}
