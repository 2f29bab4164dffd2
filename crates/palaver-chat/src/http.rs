//! HTTP implementation of every backend port.
//!
//! One client speaks to the widget backend: chatbot config, chat queries,
//! channel-specific OTP routes, speech synthesis, and transcription. Route
//! selection for OTP endpoints follows the channel argument.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use palaver_auth::{AuthError, OtpApi};
use palaver_core::config::ApiConfig;
use palaver_core::{AudioPayload, AuthChannel, ChatbotConfig, PalaverError};
use palaver_voice::{SpeechSynthesizer, Transcriber, VoiceError};

use crate::api::{ChatApi, ConfigApi, QueryRequest, QueryResponse};
use crate::error::ApiError;

/// Wire shape of a successful chat-query response. Audio arrives as a
/// base64 data URL.
#[derive(Debug, Deserialize)]
struct QueryWire {
    answer: String,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "requiresAuthNext")]
    requires_auth_next: bool,
    #[serde(default)]
    auth_method: Option<String>,
}

/// Wire shape of a 403 refusal.
#[derive(Debug, Deserialize)]
struct RefusalWire {
    error: String,
    #[serde(default)]
    auth_method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessWire {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct ValidWire {
    valid: bool,
}

#[derive(Debug, Deserialize)]
struct SpeechWire {
    audio: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptWire {
    text: String,
}

/// Backend client over reqwest.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> Result<Self, PalaverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PalaverError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Channel-specific OTP route prefix.
    fn otp_route(channel: AuthChannel, action: OtpAction) -> &'static str {
        match (channel, action) {
            (AuthChannel::Email, OtpAction::Send) => "otp/request-otp",
            (AuthChannel::Email, OtpAction::Verify) => "otp/verify-otp",
            (AuthChannel::Email, OtpAction::CheckSession) => "otp/check-session",
            (AuthChannel::Whatsapp, OtpAction::Send) => "whatsapp-otp/send",
            (AuthChannel::Whatsapp, OtpAction::Verify) => "whatsapp-otp/verify",
            (AuthChannel::Whatsapp, OtpAction::CheckSession) => "whatsapp-otp/check-session",
        }
    }

    fn destination_field(channel: AuthChannel) -> &'static str {
        match channel {
            AuthChannel::Email => "email",
            AuthChannel::Whatsapp => "phone",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OtpAction {
    Send,
    Verify,
    CheckSession,
}

#[async_trait]
impl ConfigApi for HttpBackend {
    async fn fetch_config(&self, chatbot_id: &str) -> Result<ChatbotConfig, ApiError> {
        let url = self.url(&format!("chatbot/{}/config", chatbot_id));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Protocol(format!(
                "config fetch returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl ChatApi for HttpBackend {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, ApiError> {
        let response = self
            .http
            .post(self.url("chat/query"))
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            // Only an explicit auth-required code is treated as a server
            // auth demand; any other 403 is a plain failure.
            let refusal: RefusalWire = response
                .json()
                .await
                .map_err(|e| ApiError::Protocol(e.to_string()))?;
            if matches!(refusal.error.as_str(), "NEED_AUTH" | "AUTH_REQUIRED") {
                return Err(ApiError::AuthRequired {
                    auth_method: refusal.auth_method,
                });
            }
            return Err(ApiError::Protocol(format!(
                "query refused: {}",
                refusal.error
            )));
        }
        if !status.is_success() {
            return Err(ApiError::Network(format!("query returned {}", status)));
        }

        let wire: QueryWire = response
            .json()
            .await
            .map_err(|e| ApiError::Protocol(e.to_string()))?;
        let audio = match wire.audio {
            Some(url) => match AudioPayload::from_data_url(&url) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    // Undecodable audio degrades to a text-only reply.
                    debug!(error = %e, "Dropping undecodable reply audio");
                    None
                }
            },
            None => None,
        };
        Ok(QueryResponse {
            answer: wire.answer,
            audio,
            requires_auth_next: wire.requires_auth_next,
            auth_method: wire.auth_method,
        })
    }
}

#[async_trait]
impl OtpApi for HttpBackend {
    async fn send_code(&self, channel: AuthChannel, destination: &str) -> Result<(), AuthError> {
        let route = Self::otp_route(channel, OtpAction::Send);
        let body = json!({ Self::destination_field(channel): destination });
        let response = self
            .http
            .post(self.url(route))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthError::Network(format!(
                "code request returned {}",
                response.status()
            )))
        }
    }

    async fn verify_code(
        &self,
        channel: AuthChannel,
        destination: &str,
        code: &str,
    ) -> Result<bool, AuthError> {
        let route = Self::otp_route(channel, OtpAction::Verify);
        let body = json!({
            Self::destination_field(channel): destination,
            "otp": code,
        });
        let response = self
            .http
            .post(self.url(route))
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Network(format!(
                "verify returned {}",
                response.status()
            )));
        }
        let wire: SuccessWire = response
            .json()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(wire.success)
    }

    async fn check_session(
        &self,
        channel: AuthChannel,
        destination: &str,
    ) -> Result<bool, AuthError> {
        let route = Self::otp_route(channel, OtpAction::CheckSession);
        let response = self
            .http
            .get(self.url(route))
            .query(&[(Self::destination_field(channel), destination)])
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Network(format!(
                "session check returned {}",
                response.status()
            )));
        }
        let wire: ValidWire = response
            .json()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(wire.valid)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpBackend {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, VoiceError> {
        let response = self
            .http
            .post(self.url("text-to-speech"))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VoiceError::Synthesis(format!(
                "synthesis returned {}",
                response.status()
            )));
        }
        let wire: SpeechWire = response
            .json()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        AudioPayload::from_data_url(&wire.audio)
            .map_err(|e| VoiceError::Synthesis(e.to_string()))
    }
}

#[async_trait]
impl Transcriber for HttpBackend {
    async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, VoiceError> {
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("capture")
            .mime_str(mime)
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);
        let response = self
            .http
            .post(self.url("speech-to-text"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VoiceError::Transcription(format!(
                "transcription returned {}",
                response.status()
            )));
        }
        let wire: TranscriptWire = response
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        Ok(wire.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(&ApiConfig {
            base_url: base.to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_url_joining_normalizes_slashes() {
        let b = backend("https://api.test/");
        assert_eq!(b.url("chat/query"), "https://api.test/chat/query");
        assert_eq!(b.url("/chat/query"), "https://api.test/chat/query");
    }

    #[test]
    fn test_otp_routes_follow_channel() {
        assert_eq!(
            HttpBackend::otp_route(AuthChannel::Email, OtpAction::Send),
            "otp/request-otp"
        );
        assert_eq!(
            HttpBackend::otp_route(AuthChannel::Whatsapp, OtpAction::Send),
            "whatsapp-otp/send"
        );
        assert_eq!(
            HttpBackend::otp_route(AuthChannel::Email, OtpAction::Verify),
            "otp/verify-otp"
        );
        assert_eq!(
            HttpBackend::otp_route(AuthChannel::Whatsapp, OtpAction::CheckSession),
            "whatsapp-otp/check-session"
        );
    }

    #[test]
    fn test_destination_field_follows_channel() {
        assert_eq!(HttpBackend::destination_field(AuthChannel::Email), "email");
        assert_eq!(
            HttpBackend::destination_field(AuthChannel::Whatsapp),
            "phone"
        );
    }

    #[test]
    fn test_query_wire_parses_minimal_response() {
        let wire: QueryWire = serde_json::from_str(r#"{"answer": "hi"}"#).unwrap();
        assert_eq!(wire.answer, "hi");
        assert!(wire.audio.is_none());
        assert!(!wire.requires_auth_next);
    }

    #[test]
    fn test_query_wire_parses_full_response() {
        let wire: QueryWire = serde_json::from_str(
            r#"{"answer": "hi", "audio": "data:audio/mpeg;base64,aGk=",
                "requiresAuthNext": true, "auth_method": "whatsapp"}"#,
        )
        .unwrap();
        assert!(wire.requires_auth_next);
        assert_eq!(wire.auth_method.as_deref(), Some("whatsapp"));
        let payload = AudioPayload::from_data_url(&wire.audio.unwrap()).unwrap();
        assert_eq!(payload.data, b"hi");
    }

    #[test]
    fn test_refusal_wire_parses_403_body() {
        let wire: RefusalWire = serde_json::from_str(
            r#"{"error": "NEED_AUTH", "message": "verify first", "auth_method": "email"}"#,
        )
        .unwrap();
        assert_eq!(wire.error, "NEED_AUTH");
        assert_eq!(wire.auth_method.as_deref(), Some("email"));
    }
}
