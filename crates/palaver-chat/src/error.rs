//! Error types for the backend API surface.

use palaver_core::error::PalaverError;

/// Errors from the chat and config endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server refused the request with an explicit auth-required code.
    /// Always wins over local quota bookkeeping.
    #[error("authentication required by server")]
    AuthRequired { auth_method: Option<String> },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<ApiError> for PalaverError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::AuthRequired { .. } => PalaverError::AuthRequired,
            ApiError::Network(msg) => PalaverError::Network(msg),
            ApiError::Protocol(msg) => PalaverError::Network(msg),
        }
    }
}
