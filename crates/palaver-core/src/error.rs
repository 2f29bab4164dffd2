use thiserror::Error;

/// Top-level error type for the Palaver widget runtime.
///
/// Each variant wraps a subsystem-specific failure. Subsystem crates define
/// their own error types and implement `From<SubsystemError> for PalaverError`
/// so that the `?` operator works seamlessly across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PalaverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resend cooldown active: {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },

    #[error("Authentication required")]
    AuthRequired,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Transcript was empty")]
    EmptyTranscript,

    #[error("Speech generation failed: {0}")]
    TtsGeneration(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for PalaverError {
    fn from(err: toml::de::Error) -> Self {
        PalaverError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PalaverError {
    fn from(err: toml::ser::Error) -> Self {
        PalaverError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PalaverError {
    fn from(err: serde_json::Error) -> Self {
        PalaverError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Palaver operations.
pub type Result<T> = std::result::Result<T, PalaverError>;
