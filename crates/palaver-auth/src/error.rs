//! Error types for the authentication flow.

use palaver_core::error::PalaverError;

/// Errors from the quota gate and OTP flow.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid destination for {channel}: {destination}")]
    InvalidDestination {
        channel: palaver_core::AuthChannel,
        destination: String,
    },
    #[error("code must be exactly {0} digits")]
    InvalidCode(usize),
    #[error("code was rejected by the server")]
    CodeRejected,
    #[error("resend cooldown active: {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },
    #[error("cannot {action} from {state} state")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    #[error("network error: {0}")]
    Network(String),
}

impl From<AuthError> for PalaverError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::CooldownActive { remaining_secs } => {
                PalaverError::CooldownActive { remaining_secs }
            }
            AuthError::Network(msg) => PalaverError::Network(msg),
            other => PalaverError::Validation(other.to_string()),
        }
    }
}
