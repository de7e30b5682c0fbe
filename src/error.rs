use axum::{
    http::{header::RETRY_AFTER, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure taxonomy of the protection layer. Store and decode failures are
/// recovered where they happen (degrade to the local tier, or fail open at
/// the gateway) and only logged; the one variant a caller ever sees is the
/// 429 produced for rejected requests.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Shared store unreachable: {0}")]
    StoreUnreachable(#[from] redis::RedisError),

    #[error("Cached payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(RETRY_AFTER, retry_after_secs.to_string())],
                self.to_string(),
            )
                .into_response(),
            AppError::StoreUnreachable { .. } | AppError::Decode { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
        }
    }
}
