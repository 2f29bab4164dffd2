//! Top-level message dispatch.
//!
//! `send` gates synchronously against verification, quota, and any pending
//! auth gate before touching the network. Quota is recorded only after a
//! successful response, and a server-asserted auth demand always wins over
//! local bookkeeping.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use palaver_auth::{AuthFlow, QuotaGate};
use palaver_core::{AuthChannel, ChatMessage};
use palaver_voice::{AudioArbiter, TtsCoordinator};

use crate::api::{ChatApi, QueryRequest};
use crate::error::ApiError;
use crate::transcript::Transcript;

/// What happened to a `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The query was sent and a bot reply was appended.
    Delivered,
    /// Blank input; nothing was sent or appended.
    Ignored,
    /// Aborted before the network: the free-message allowance is spent.
    GatedQuota,
    /// Aborted before the network: an auth gate is already pending.
    GatedPending,
    /// The server refused with an explicit auth-required response.
    AuthDemanded,
    /// The query failed; a generic failure message was appended.
    Failed,
}

/// Routes outbound text through the gate checks and the chat endpoint.
pub struct MessageDispatcher {
    api: Arc<dyn ChatApi>,
    transcript: Arc<Transcript>,
    quota: QuotaGate,
    auth: Arc<AuthFlow>,
    arbiter: Arc<AudioArbiter>,
    tts: Arc<TtsCoordinator>,
    chatbot_id: String,
    session_id: String,
    /// Channel the server last asked authentication to happen over.
    server_channel: Mutex<Option<AuthChannel>>,
    failure_text: String,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn ChatApi>,
        transcript: Arc<Transcript>,
        quota: QuotaGate,
        auth: Arc<AuthFlow>,
        arbiter: Arc<AudioArbiter>,
        tts: Arc<TtsCoordinator>,
        chatbot_id: &str,
        session_id: &str,
    ) -> Self {
        Self {
            api,
            transcript,
            quota,
            auth,
            arbiter,
            tts,
            chatbot_id: chatbot_id.to_string(),
            session_id: session_id.to_string(),
            server_channel: Mutex::new(None),
            failure_text: "Something went wrong. Please try again.".to_string(),
        }
    }

    /// The channel the server last demanded authentication over, if any.
    pub fn server_channel(&self) -> Option<AuthChannel> {
        *self.server_channel.lock().expect("dispatch mutex poisoned")
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    /// Dispatch user text to the chat endpoint.
    ///
    /// Preconditions run in order and abort without a network call: an
    /// unverified session with a spent allowance engages the gate, and a
    /// session already inside the auth flow sends nothing. The composing
    /// indicator is cleared on every exit path.
    pub async fn send(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Ignored;
        }

        let verified = self.auth.is_verified();
        if !verified && self.quota.exhausted() {
            info!("Send blocked: free-message quota exhausted");
            self.auth.engage_gate();
            self.transcript.set_composing(false);
            return SendOutcome::GatedQuota;
        }
        if !verified && self.auth.gate_pending() {
            debug!("Send blocked: auth gate pending");
            self.transcript.set_composing(false);
            return SendOutcome::GatedPending;
        }

        self.transcript.push(ChatMessage::user(text));
        self.transcript.set_composing(true);

        let request = self.build_request(text);
        match self.api.query(&request).await {
            Ok(response) => {
                let mut message = ChatMessage::bot(&response.answer);
                message.requires_auth_next = response.requires_auth_next;
                message.audio = response.audio.clone();
                let bot_index = self.transcript.push(message);

                match response.audio {
                    Some(audio) => {
                        // Server-provided speech plays immediately; a
                        // playback failure never blocks the text.
                        if let Err(e) = self.arbiter.play(&audio, bot_index) {
                            warn!(bot_index, error = %e, "Reply playback failed");
                        }
                    }
                    None => self.tts.ensure_speech(&response.answer, bot_index),
                }

                if !verified && self.quota.record_free_message_sent() {
                    self.auth.engage_gate();
                }
                if response.requires_auth_next {
                    info!("Server requires authentication for the next message");
                    if let Some(method) = &response.auth_method {
                        self.note_channel(method);
                    }
                    self.auth.engage_gate();
                }

                self.transcript.set_composing(false);
                SendOutcome::Delivered
            }
            Err(ApiError::AuthRequired { auth_method }) => {
                info!("Server refused the query: authentication required");
                if let Some(method) = &auth_method {
                    self.note_channel(method);
                }
                self.auth.engage_gate();
                self.transcript.set_composing(false);
                SendOutcome::AuthDemanded
            }
            Err(e) => {
                warn!(error = %e, "Chat query failed");
                self.transcript.push(ChatMessage::bot(&self.failure_text));
                self.transcript.set_composing(false);
                SendOutcome::Failed
            }
        }
    }

    fn build_request(&self, text: &str) -> QueryRequest {
        let mut request = QueryRequest {
            chatbot_id: self.chatbot_id.clone(),
            query: text.to_string(),
            session_id: self.session_id.clone(),
            email: None,
            phone: None,
        };
        if let Some((channel, destination)) = self.auth.verified_contact() {
            match channel {
                AuthChannel::Email => request.email = Some(destination),
                AuthChannel::Whatsapp => request.phone = Some(destination),
            }
        }
        request
    }

    fn note_channel(&self, method: &str) {
        *self.server_channel.lock().expect("dispatch mutex poisoned") =
            Some(AuthChannel::from_auth_method(method));
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("chatbot_id", &self.chatbot_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
