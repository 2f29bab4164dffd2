//! Error types for the audio subsystem.

use palaver_core::error::PalaverError;

/// Errors from playback, speech generation, and microphone capture.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no supported capture encoding")]
    NoSupportedEncoding,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("speech generation failed: {0}")]
    Synthesis(String),
    #[error("network error: {0}")]
    Network(String),
}

impl From<VoiceError> for PalaverError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(msg) => PalaverError::PermissionDenied(msg),
            VoiceError::Transcription(msg) => PalaverError::Transcription(msg),
            VoiceError::Synthesis(msg) => PalaverError::TtsGeneration(msg),
            VoiceError::Network(msg) => PalaverError::Network(msg),
            other => PalaverError::Audio(other.to_string()),
        }
    }
}
