//! Shared types crossing crate boundaries: channels, messages, audio
//! payloads, and the server-fetched chatbot configuration.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::PalaverError;

/// Authentication delivery channel for one-time codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthChannel {
    /// Code delivered to an email address.
    Email,
    /// Code delivered to a WhatsApp number.
    Whatsapp,
}

impl std::fmt::Display for AuthChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthChannel::Email => write!(f, "email"),
            AuthChannel::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

impl AuthChannel {
    /// Parse a server-provided `auth_method` string, defaulting to email
    /// for unrecognized values.
    pub fn from_auth_method(method: &str) -> Self {
        match method {
            "whatsapp" => AuthChannel::Whatsapp,
            _ => AuthChannel::Email,
        }
    }
}

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// A decoded synthesized-speech audio resource tied to one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPayload {
    /// MIME type of the encoded audio, e.g. `audio/mpeg`.
    pub mime: String,
    /// Raw encoded audio bytes.
    pub data: Vec<u8>,
}

impl AudioPayload {
    /// Decode a `data:` URL of the form `data:audio/mpeg;base64,<payload>`.
    pub fn from_data_url(url: &str) -> Result<Self, PalaverError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| PalaverError::Audio("not a data URL".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| PalaverError::Audio("malformed data URL".to_string()))?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or_else(|| PalaverError::Audio("data URL is not base64-encoded".to_string()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| PalaverError::Audio(format!("base64 decode failed: {}", e)))?;
        Ok(Self {
            mime: mime.to_string(),
            data,
        })
    }

    /// Duration-free size check used by playback code to reject empty clips.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One entry in the append-only conversation transcript.
///
/// The position of a message in the transcript is its identity for audio
/// playback purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    /// Synthesized speech for this message, if any was generated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioPayload>,
    /// Server signal that the next message requires authentication.
    #[serde(default)]
    pub requires_auth_next: bool,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            audio: None,
            requires_auth_next: false,
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            text: text.into(),
            audio: None,
            requires_auth_next: false,
        }
    }
}

/// Per-chatbot configuration fetched from the backend.
///
/// Field names match the wire format of the config endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatbotConfig {
    /// Which channel OTPs are delivered over.
    pub auth_method: AuthChannel,
    /// Free messages permitted before the auth gate engages.
    pub free_messages: u32,
    /// Gate every message from the first one.
    pub require_auth_from_start: bool,
    /// Authentication is enabled for this chatbot at all.
    pub require_auth: bool,
    /// Optional copy shown alongside the gate.
    pub require_auth_text: Option<String>,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            auth_method: AuthChannel::Email,
            free_messages: 3,
            require_auth_from_start: false,
            require_auth: true,
            require_auth_text: None,
        }
    }
}
