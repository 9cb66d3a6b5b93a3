use thiserror::Error;

/// Failures surfaced by the pool and coordinator. The HTTP layer maps
/// these onto status codes: `NotReady` and `PoolExhausted` become 503,
/// everything else 500.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerateError {
    #[error("service is not ready")]
    NotReady,

    #[error(
        "service is busy: maximum concurrent requests: {max}, current active requests: {active}"
    )]
    PoolExhausted { active: usize, max: usize },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl GenerateError {
    /// Whether a caller can expect the request to succeed on a later retry
    /// without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerateError::NotReady | GenerateError::PoolExhausted { .. }
        )
    }
}
