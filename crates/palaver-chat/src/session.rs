//! Session assembly for an embedding host.
//!
//! `WidgetSession::start` fetches the chatbot's server-side settings, wires
//! every component over a shared session store, restores persisted auth
//! state, and pumps voice transcripts into the dispatcher as if they were
//! typed.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use palaver_auth::{AuthFlow, OtpApi, QuotaGate};
use palaver_core::clock::Clock;
use palaver_core::{ChatMessage, ChatbotConfig, WidgetConfig};
use palaver_storage::SessionStore;
use palaver_voice::{
    AudioArbiter, ClipPlayer, MicrophoneSource, RecordingPipeline, SpeechSynthesizer, Transcriber,
    TtsCoordinator,
};

use crate::api::{ChatApi, ConfigApi};
use crate::dispatch::MessageDispatcher;
use crate::http::HttpBackend;
use crate::transcript::Transcript;

/// Everything a session needs from the outside world.
///
/// Network ports usually all point at one `HttpBackend`; hardware ports
/// come from the embedding host.
pub struct SessionDeps {
    pub store: Arc<SessionStore>,
    pub config_api: Arc<dyn ConfigApi>,
    pub chat_api: Arc<dyn ChatApi>,
    pub otp_api: Arc<dyn OtpApi>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn ClipPlayer>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub transcriber: Arc<dyn Transcriber>,
    pub clock: Arc<dyn Clock>,
}

impl SessionDeps {
    /// Wire all network ports to one HTTP backend.
    pub fn over_http(
        backend: Arc<HttpBackend>,
        store: Arc<SessionStore>,
        player: Arc<dyn ClipPlayer>,
        microphone: Arc<dyn MicrophoneSource>,
    ) -> Self {
        Self {
            store,
            config_api: Arc::clone(&backend) as Arc<dyn ConfigApi>,
            chat_api: Arc::clone(&backend) as Arc<dyn ChatApi>,
            otp_api: Arc::clone(&backend) as Arc<dyn OtpApi>,
            synthesizer: Arc::clone(&backend) as Arc<dyn SpeechSynthesizer>,
            player,
            microphone,
            transcriber: backend as Arc<dyn Transcriber>,
            clock: Arc::new(palaver_core::clock::SystemClock),
        }
    }
}

/// A fully wired conversation session.
pub struct WidgetSession {
    pub transcript: Arc<Transcript>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub auth: Arc<AuthFlow>,
    pub arbiter: Arc<AudioArbiter>,
    pub tts: Arc<TtsCoordinator>,
    pub recording: Arc<RecordingPipeline>,
    chatbot_config: ChatbotConfig,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WidgetSession {
    /// Assemble and start a session for one chatbot.
    ///
    /// A failed config fetch degrades to the default chatbot settings so
    /// the conversation still opens. The greeting, when present, occupies
    /// transcript slot 0 and gets speech generated for it.
    pub async fn start(
        deps: SessionDeps,
        config: &WidgetConfig,
        chatbot_id: &str,
        greeting: Option<&str>,
    ) -> Self {
        let chatbot_config = match deps.config_api.fetch_config(chatbot_id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(chatbot_id, error = %e, "Config fetch failed, using defaults");
                ChatbotConfig::default()
            }
        };
        info!(
            chatbot_id,
            auth_method = %chatbot_config.auth_method,
            free_messages = chatbot_config.free_messages,
            "Session starting"
        );

        // Auth disabled means messaging is never gated.
        let limit = if chatbot_config.require_auth {
            chatbot_config.free_messages
        } else {
            u32::MAX
        };

        let auth = Arc::new(AuthFlow::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.otp_api),
            Arc::clone(&deps.clock),
            &config.auth,
        ));
        auth.restore(chatbot_config.auth_method).await;
        if chatbot_config.require_auth
            && chatbot_config.require_auth_from_start
            && !auth.is_verified()
        {
            auth.engage_gate();
        }

        let transcript = Arc::new(Transcript::new());
        let arbiter = Arc::new(AudioArbiter::new(Arc::clone(&deps.player)));
        let delivery_sink = Arc::clone(&transcript);
        let tts = Arc::new(TtsCoordinator::new(
            Arc::clone(&deps.synthesizer),
            Arc::new(move |slot, payload| delivery_sink.attach_audio(slot, payload)),
            &config.tts,
        ));

        let (transcripts_tx, mut transcripts_rx) = mpsc::unbounded_channel::<String>();
        let recording = Arc::new(RecordingPipeline::new(
            Arc::clone(&deps.microphone),
            Arc::clone(&deps.transcriber),
            Arc::clone(&deps.clock),
            &config.recording,
            Some(transcripts_tx),
        ));

        let session_id = deps.store.session_id();
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&deps.chat_api),
            Arc::clone(&transcript),
            QuotaGate::new(Arc::clone(&deps.store), limit),
            Arc::clone(&auth),
            Arc::clone(&arbiter),
            Arc::clone(&tts),
            chatbot_id,
            &session_id,
        ));

        // Voice transcripts enter the same path as typed input.
        let pump_dispatcher = Arc::clone(&dispatcher);
        let pump = tokio::spawn(async move {
            while let Some(text) = transcripts_rx.recv().await {
                pump_dispatcher.send(&text).await;
            }
        });

        if let Some(greeting) = greeting.filter(|g| !g.trim().is_empty()) {
            let slot = transcript.push(ChatMessage::bot(greeting));
            tts.ensure_speech(greeting, slot);
        }

        Self {
            transcript,
            dispatcher,
            auth,
            arbiter,
            tts,
            recording,
            chatbot_config,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn chatbot_config(&self) -> &ChatbotConfig {
        &self.chatbot_config
    }

    /// Tear the session down: release the microphone, stop playback, and
    /// cancel pending speech generation. Synchronous, safe to call twice.
    pub fn shutdown(&self) {
        self.recording.abort();
        self.arbiter.stop();
        self.tts.cancel();
        if let Some(pump) = self.pump.lock().expect("session mutex poisoned").take() {
            pump.abort();
        }
        info!("Session shut down");
    }
}

impl Drop for WidgetSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WidgetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetSession")
            .field("chatbot_config", &self.chatbot_config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockChatApi;
    use crate::dispatch::SendOutcome;
    use palaver_auth::MockOtpApi;
    use palaver_core::clock::SystemClock;
    use palaver_core::{AuthChannel, Sender};
    use palaver_voice::{MockClipPlayer, MockMicrophone, MockSynthesizer, MockTranscriber};

    struct Mocks {
        chat: Arc<MockChatApi>,
        otp: Arc<MockOtpApi>,
        mic: Arc<MockMicrophone>,
        store: Arc<SessionStore>,
    }

    fn deps() -> (SessionDeps, Mocks) {
        let chat = Arc::new(MockChatApi::answering("bot reply"));
        let otp = Arc::new(MockOtpApi::accepting("123456"));
        let mic = Arc::new(MockMicrophone::new());
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        let deps = SessionDeps {
            store: Arc::clone(&store),
            config_api: Arc::clone(&chat) as Arc<dyn ConfigApi>,
            chat_api: Arc::clone(&chat) as Arc<dyn ChatApi>,
            otp_api: Arc::clone(&otp) as Arc<dyn OtpApi>,
            synthesizer: Arc::new(MockSynthesizer::new()),
            player: Arc::new(MockClipPlayer::new()),
            microphone: Arc::clone(&mic) as Arc<dyn MicrophoneSource>,
            transcriber: Arc::new(MockTranscriber::returning("voice question")),
            clock: Arc::new(SystemClock),
        };
        (
            deps,
            Mocks {
                chat,
                otp,
                mic,
                store,
            },
        )
    }

    // ---- Assembly ----

    #[tokio::test(start_paused = true)]
    async fn test_greeting_occupies_slot_zero_with_speech() {
        let (deps, _) = deps();
        let session =
            WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", Some("Welcome!")).await;

        let first = session.transcript.get(0).unwrap();
        assert_eq!(first.sender, Sender::Bot);
        assert_eq!(first.text, "Welcome!");

        // Speech lands on the greeting after the debounce window.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(session.transcript.get(0).unwrap().audio.is_some());
    }

    #[tokio::test]
    async fn test_no_greeting_leaves_transcript_empty() {
        let (deps, _) = deps();
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;
        assert!(session.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_config_fetch_failure_uses_defaults() {
        let (deps, mocks) = deps();
        mocks.chat.set_fail_config(true);
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;
        assert_eq!(session.chatbot_config().free_messages, 3);
    }

    // ---- Gating from server settings ----

    #[tokio::test]
    async fn test_require_auth_from_start_gates_first_send() {
        let (deps, mocks) = deps();
        mocks.chat.set_config(ChatbotConfig {
            require_auth_from_start: true,
            ..ChatbotConfig::default()
        });
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;

        assert!(session.auth.gate_pending());
        assert_eq!(
            session.dispatcher.send("hi").await,
            SendOutcome::GatedPending
        );
        assert_eq!(mocks.chat.query_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_disabled_never_gates() {
        let (deps, mocks) = deps();
        mocks.chat.set_config(ChatbotConfig {
            require_auth: false,
            free_messages: 0,
            ..ChatbotConfig::default()
        });
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;

        for _ in 0..5 {
            assert_eq!(session.dispatcher.send("hi").await, SendOutcome::Delivered);
        }
        assert!(!session.auth.gate_pending());
    }

    #[tokio::test]
    async fn test_restores_verified_identity_on_start() {
        let (deps, mocks) = deps();
        mocks
            .store
            .set_verified_contact(AuthChannel::Email, "a@b.com");
        mocks.otp.set_session_valid(true);
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;

        assert!(session.auth.is_verified());
        session.dispatcher.send("hi").await;
        let request = mocks.chat.last_request().unwrap();
        assert_eq!(request.email.as_deref(), Some("a@b.com"));
    }

    // ---- Voice path ----

    #[tokio::test(start_paused = true)]
    async fn test_voice_transcript_dispatched_as_typed_input() {
        let (deps, mocks) = deps();
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;

        session.recording.start().await.unwrap();
        session.recording.stop().await.unwrap();
        // Let the pump task pick the transcript up.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let messages = session.transcript.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].text, "voice question");
        assert_eq!(messages[1].text, "bot reply");
        assert_eq!(mocks.mic.release_count(), 1);
    }

    // ---- Shutdown ----

    #[tokio::test]
    async fn test_shutdown_releases_microphone() {
        let (deps, mocks) = deps();
        let session = WidgetSession::start(deps, &WidgetConfig::default(), "bot-1", None).await;

        session.recording.start().await.unwrap();
        session.shutdown();
        assert_eq!(mocks.mic.release_count(), 1);
        // Idempotent.
        session.shutdown();
        assert_eq!(mocks.mic.release_count(), 1);
    }
}
