//! Debounced, deduplicated text-to-speech generation.
//!
//! Spoken audio is an enhancement: generation failures are retried with
//! linear backoff and then abandoned silently, never blocking text
//! delivery. Debounce timers are cancelled and replaced, never stacked;
//! once a request's debounce elapses its generation runs to completion
//! independently of later requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use palaver_core::config::TtsConfig;
use palaver_core::AudioPayload;

use crate::error::VoiceError;

/// Speech synthesis endpoint.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, VoiceError>;
}

/// Callback handing a finished clip to the message slot that requested it
/// (slot 0 is the greeting).
pub type ClipDelivery = Arc<dyn Fn(usize, AudioPayload) + Send + Sync>;

/// Coordinates speech generation for the greeting and bot replies.
pub struct TtsCoordinator {
    synth: Arc<dyn SpeechSynthesizer>,
    deliver: ClipDelivery,
    debounce: Duration,
    max_retries: u32,
    backoff_step: Duration,
    last_text: Mutex<Option<String>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TtsCoordinator {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>, deliver: ClipDelivery, config: &TtsConfig) -> Self {
        Self {
            synth,
            deliver,
            debounce: Duration::from_millis(config.debounce_ms),
            max_retries: config.max_retries,
            backoff_step: Duration::from_secs(config.retry_backoff_secs),
            last_text: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Trigger generation for `text`, at most once per distinct text.
    ///
    /// Rapid repeated calls are coalesced by the debounce window; a call
    /// with different text replaces a request still inside its debounce
    /// window. A request past the debounce is already generating and is
    /// left alone.
    pub fn ensure_speech(&self, text: &str, slot: usize) {
        if text.trim().is_empty() {
            return;
        }

        {
            let mut last = self.last_text.lock().expect("tts mutex poisoned");
            if last.as_deref() == Some(text) {
                debug!(slot, "Speech already requested for this text");
                return;
            }
            *last = Some(text.to_string());
        }

        let synth = Arc::clone(&self.synth);
        let deliver = Arc::clone(&self.deliver);
        let debounce = self.debounce;
        let max_retries = self.max_retries;
        let backoff_step = self.backoff_step;
        let text = text.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // The debounce survived; detach the generation so a later
            // request can no longer abort it mid-retry.
            tokio::spawn(async move {
                generate_with_retry(&*synth, &deliver, &text, slot, max_retries, backoff_step)
                    .await;
            });
        });

        // Replace, never stack: a newer request cancels the older timer.
        let mut pending = self.pending.lock().expect("tts mutex poisoned");
        if let Some(old) = pending.replace(task) {
            old.abort();
        }
    }

    /// Cancel a generation still in its debounce window (widget unmount).
    pub fn cancel(&self) {
        if let Some(task) = self.pending.lock().expect("tts mutex poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for TtsCoordinator {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for TtsCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsCoordinator")
            .field("debounce", &self.debounce)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

async fn generate_with_retry(
    synth: &dyn SpeechSynthesizer,
    deliver: &ClipDelivery,
    text: &str,
    slot: usize,
    max_retries: u32,
    backoff_step: Duration,
) {
    for attempt in 0..=max_retries {
        match synth.synthesize(text).await {
            Ok(payload) => {
                debug!(slot, attempt, bytes = payload.data.len(), "Speech generated");
                deliver(slot, payload);
                return;
            }
            Err(e) if attempt < max_retries => {
                // Linear backoff: 1s after the first failure, 2s after the second.
                let wait = backoff_step * (attempt + 1);
                debug!(slot, attempt, error = %e, "Speech generation failed, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                warn!(slot, error = %e, "Speech generation abandoned");
            }
        }
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Mock synthesizer: fails a configurable number of initial attempts, then
/// returns a clip echoing the input text.
#[derive(Debug, Default)]
pub struct MockSynthesizer {
    calls: std::sync::atomic::AtomicUsize,
    fail_first: std::sync::atomic::AtomicUsize,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the first `n` synthesize calls fail.
    pub fn failing_first(n: usize) -> Self {
        let mock = Self::default();
        mock.fail_first
            .store(n, std::sync::atomic::Ordering::Relaxed);
        mock
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, VoiceError> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if call < self.fail_first.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(VoiceError::Synthesis("mock transient failure".to_string()));
        }
        Ok(AudioPayload {
            mime: "audio/mpeg".to_string(),
            data: text.as_bytes().to_vec(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
