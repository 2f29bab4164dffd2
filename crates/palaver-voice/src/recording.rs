//! Microphone capture pipeline with a strict state machine.
//!
//! Valid transitions:
//! - Idle -> Capturing (start)
//! - Capturing -> Transcribing (stop, chunks handed to transcription)
//! - Transcribing -> Idle (transcript produced or empty)
//! - Capturing -> Idle (abort)
//! - Capturing -> Error, Transcribing -> Error, Error -> Idle (failures)
//!
//! Every exit path releases the hardware stream and lands in Idle, so the
//! microphone indicator never stays active.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use palaver_core::clock::Clock;
use palaver_core::config::RecordingConfig;

use crate::error::VoiceError;

/// Operational state of the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    /// No capture in progress. Ready to start.
    Idle,
    /// Microphone acquired, chunks accumulating.
    Capturing,
    /// Captured audio handed to the transcription endpoint.
    Transcribing,
    /// A capture attempt failed; transient, resolves to Idle.
    Error,
}

impl RecordingState {
    pub fn name(&self) -> &'static str {
        match self {
            RecordingState::Idle => "Idle",
            RecordingState::Capturing => "Capturing",
            RecordingState::Transcribing => "Transcribing",
            RecordingState::Error => "Error",
        }
    }

    /// Returns whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &RecordingState) -> bool {
        matches!(
            (self, target),
            (RecordingState::Idle, RecordingState::Capturing)
                | (RecordingState::Capturing, RecordingState::Transcribing)
                | (RecordingState::Transcribing, RecordingState::Idle)
                // Abort
                | (RecordingState::Capturing, RecordingState::Idle)
                // Failure paths
                | (RecordingState::Capturing, RecordingState::Error)
                | (RecordingState::Transcribing, RecordingState::Error)
                | (RecordingState::Error, RecordingState::Idle)
        )
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Thread-safe state machine for the capture lifecycle.
#[derive(Debug, Clone)]
struct StateMachine {
    state: Arc<Mutex<RecordingState>>,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RecordingState::Idle)),
        }
    }

    fn current(&self) -> RecordingState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn transition(&self, target: RecordingState) -> Result<(), VoiceError> {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if state.can_transition_to(&target) {
            debug!("Recording state: {} -> {}", *state, target);
            *state = target;
            Ok(())
        } else {
            Err(VoiceError::InvalidTransition {
                from: state.name(),
                to: target.name(),
            })
        }
    }

    /// Force the state machine back to Idle (error recovery).
    fn reset(&self) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state != RecordingState::Idle {
            warn!("Recording state reset to Idle from {}", *state);
            *state = RecordingState::Idle;
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Access to the microphone hardware.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Request microphone access. Denial maps to `PermissionDenied`.
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, VoiceError>;
}

/// An open hardware capture stream.
///
/// `release` frees the hardware handle and must be idempotent.
pub trait CaptureStream: Send {
    /// Whether the stream can capture in the given encoding.
    fn supports(&self, mime: &str) -> bool;
    /// Begin capturing in the given encoding.
    fn start(&mut self, mime: &str) -> Result<(), VoiceError>;
    /// Take all chunks captured so far.
    fn drain(&mut self) -> Vec<Vec<u8>>;
    /// Release the hardware handle.
    fn release(&mut self);
}

/// Speech-to-text endpoint.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, VoiceError>;
}

// =============================================================================
// Pipeline
// =============================================================================

struct CaptureSession {
    stream: Box<dyn CaptureStream>,
    mime: String,
    deadline: DateTime<Utc>,
}

/// Manages microphone acquisition, codec negotiation, bounded capture, and
/// hand-off to transcription.
pub struct RecordingPipeline {
    state: StateMachine,
    mic: Arc<dyn MicrophoneSource>,
    transcriber: Arc<dyn Transcriber>,
    clock: Arc<dyn Clock>,
    max_duration_secs: u64,
    mime_preferences: Vec<String>,
    session: Mutex<Option<CaptureSession>>,
    ceiling: Mutex<Option<JoinHandle<()>>>,
    /// Successful transcripts are forwarded here as if typed.
    transcripts: Option<UnboundedSender<String>>,
}

impl RecordingPipeline {
    pub fn new(
        mic: Arc<dyn MicrophoneSource>,
        transcriber: Arc<dyn Transcriber>,
        clock: Arc<dyn Clock>,
        config: &RecordingConfig,
        transcripts: Option<UnboundedSender<String>>,
    ) -> Self {
        Self {
            state: StateMachine::new(),
            mic,
            transcriber,
            clock,
            max_duration_secs: config.max_duration_secs,
            mime_preferences: config.mime_preferences.clone(),
            session: Mutex::new(None),
            ceiling: Mutex::new(None),
            transcripts,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state.current()
    }

    /// Milliseconds until the ceiling auto-stop fires, if capturing.
    pub fn remaining_ms(&self) -> Option<i64> {
        let session = self.session.lock().expect("session mutex poisoned");
        session
            .as_ref()
            .map(|s| (s.deadline - self.clock.now()).num_milliseconds().max(0))
    }

    /// Start a capture session.
    ///
    /// Acquires the microphone, negotiates the first supported encoding
    /// from the preference list, and arms the hard ceiling timer.
    pub async fn start(self: &Arc<Self>) -> Result<(), VoiceError> {
        self.state.transition(RecordingState::Capturing)?;

        let mut stream = match self.mic.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Microphone acquisition failed");
                self.fail_to_idle();
                return Err(e);
            }
        };

        let Some(mime) = self
            .mime_preferences
            .iter()
            .find(|m| stream.supports(m))
            .cloned()
        else {
            stream.release();
            self.fail_to_idle();
            return Err(VoiceError::NoSupportedEncoding);
        };

        if let Err(e) = stream.start(&mime) {
            stream.release();
            self.fail_to_idle();
            return Err(e);
        }

        let deadline =
            self.clock.now() + chrono::Duration::seconds(self.max_duration_secs as i64);
        info!(%mime, max_secs = self.max_duration_secs, "Capture started");
        *self.session.lock().expect("session mutex poisoned") = Some(CaptureSession {
            stream,
            mime,
            deadline,
        });

        // Ceiling timer: auto-stop when the hard duration bound is hit. The
        // task removes its own handle first so stop() does not abort the
        // very task that is running it.
        let pipeline = Arc::clone(self);
        let sleep_for = std::time::Duration::from_secs(self.max_duration_secs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;
            pipeline
                .ceiling
                .lock()
                .expect("ceiling mutex poisoned")
                .take();
            debug!("Recording ceiling reached, auto-stopping");
            let _ = pipeline.stop().await;
        });
        *self.ceiling.lock().expect("ceiling mutex poisoned") = Some(handle);

        Ok(())
    }

    /// Stop capturing and hand the audio to transcription.
    ///
    /// Idempotent: stopping when not capturing returns `Ok(None)`. The
    /// hardware stream is released on every path. An empty or
    /// whitespace-only transcript is not an error and sends nothing; a
    /// successful transcript is forwarded to the dispatcher sink.
    pub async fn stop(&self) -> Result<Option<String>, VoiceError> {
        if self.state.transition(RecordingState::Transcribing).is_err() {
            return Ok(None);
        }

        if let Some(handle) = self.ceiling.lock().expect("ceiling mutex poisoned").take() {
            handle.abort();
        }

        let session = self.session.lock().expect("session mutex poisoned").take();
        let Some(mut session) = session else {
            let _ = self.state.transition(RecordingState::Idle);
            return Ok(None);
        };

        let chunks = session.stream.drain();
        session.stream.release();

        let audio: Vec<u8> = chunks.concat();
        if audio.is_empty() {
            debug!("No audio captured");
            let _ = self.state.transition(RecordingState::Idle);
            return Ok(None);
        }

        info!(bytes = audio.len(), mime = %session.mime, "Transcribing capture");
        match self.transcriber.transcribe(audio, &session.mime).await {
            Ok(text) if !text.trim().is_empty() => {
                self.state.transition(RecordingState::Idle)?;
                if let Some(sink) = &self.transcripts {
                    let _ = sink.send(text.clone());
                }
                Ok(Some(text))
            }
            Ok(_) => {
                debug!("Transcript was empty");
                self.state.transition(RecordingState::Idle)?;
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Transcription failed");
                self.fail_to_idle();
                Err(e)
            }
        }
    }

    /// Synchronous teardown for unmount or navigation.
    ///
    /// Releases the hardware handle and cancels the ceiling timer without
    /// attempting transcription.
    pub fn abort(&self) {
        if let Some(handle) = self.ceiling.lock().expect("ceiling mutex poisoned").take() {
            handle.abort();
        }
        if let Some(mut session) = self.session.lock().expect("session mutex poisoned").take() {
            session.stream.release();
            info!("Capture aborted, hardware released");
        }
        self.state.reset();
    }

    fn fail_to_idle(&self) {
        let _ = self.state.transition(RecordingState::Error);
        let _ = self.state.transition(RecordingState::Idle);
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        // No deferred cleanup: dropping the pipeline mid-capture must still
        // release the microphone.
        if let Ok(mut session) = self.session.lock() {
            if let Some(session) = session.as_mut() {
                session.stream.release();
            }
        }
    }
}

impl std::fmt::Debug for RecordingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingPipeline")
            .field("state", &self.state.current())
            .field("max_duration_secs", &self.max_duration_secs)
            .finish()
    }
}

// =============================================================================
// Mock implementations
// =============================================================================

/// Mock microphone for tests: configurable permission denial, supported
/// encodings, and canned chunk data. Counts hardware releases so tests can
/// assert the release-exactly-once property.
#[derive(Debug)]
pub struct MockMicrophone {
    deny: std::sync::atomic::AtomicBool,
    supported: Mutex<Vec<String>>,
    chunks: Mutex<Vec<Vec<u8>>>,
    releases: Arc<std::sync::atomic::AtomicUsize>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            deny: std::sync::atomic::AtomicBool::new(false),
            supported: Mutex::new(vec!["audio/webm;codecs=opus".to_string()]),
            chunks: Mutex::new(vec![vec![1, 2], vec![3, 4]]),
            releases: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub fn deny_permission(&self) {
        self.deny.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_supported(&self, mimes: Vec<String>) {
        *self.supported.lock().expect("mock mutex poisoned") = mimes;
    }

    pub fn set_chunks(&self, chunks: Vec<Vec<u8>>) {
        *self.chunks.lock().expect("mock mutex poisoned") = chunks;
    }

    /// Number of times a stream's hardware handle has been released.
    pub fn release_count(&self) -> usize {
        self.releases.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MicrophoneSource for MockMicrophone {
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, VoiceError> {
        if self.deny.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(VoiceError::PermissionDenied(
                "user denied microphone access".to_string(),
            ));
        }
        Ok(Box::new(MockStream {
            supported: self.supported.lock().expect("mock mutex poisoned").clone(),
            chunks: self.chunks.lock().expect("mock mutex poisoned").clone(),
            released: false,
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct MockStream {
    supported: Vec<String>,
    chunks: Vec<Vec<u8>>,
    released: bool,
    releases: Arc<std::sync::atomic::AtomicUsize>,
}

impl CaptureStream for MockStream {
    fn supports(&self, mime: &str) -> bool {
        self.supported.iter().any(|m| m == mime)
    }

    fn start(&mut self, _mime: &str) -> Result<(), VoiceError> {
        Ok(())
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.chunks)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.releases
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Mock speech-to-text endpoint for tests.
#[derive(Debug)]
pub struct MockTranscriber {
    text: Mutex<String>,
    fail: std::sync::atomic::AtomicBool,
    calls: std::sync::atomic::AtomicUsize,
    last_mime: Mutex<Option<String>>,
}

impl MockTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            text: Mutex::new(text.to_string()),
            fail: std::sync::atomic::AtomicBool::new(false),
            calls: std::sync::atomic::AtomicUsize::new(0),
            last_mime: Mutex::new(None),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn last_mime(&self) -> Option<String> {
        self.last_mime.lock().expect("mock mutex poisoned").clone()
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::returning("hello world")
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, mime: &str) -> Result<String, VoiceError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *self.last_mime.lock().expect("mock mutex poisoned") = Some(mime.to_string());
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(VoiceError::Transcription("mock failure".to_string()));
        }
        Ok(self.text.lock().expect("mock mutex poisoned").clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
