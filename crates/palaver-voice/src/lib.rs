//! Audio concerns of the widget runtime.
//!
//! `AudioArbiter` guarantees at most one decoded speech clip at a time,
//! `TtsCoordinator` debounces and retries speech generation, and
//! `RecordingPipeline` manages microphone capture through a strict state
//! machine. All hardware and network access goes through traits with mock
//! implementations for testing.

pub mod arbiter;
pub mod error;
pub mod recording;
pub mod tts;

pub use arbiter::{AudioArbiter, ClipPlayer, DecodedClip, MockClipPlayer};
pub use error::VoiceError;
pub use recording::{
    CaptureStream, MicrophoneSource, MockMicrophone, MockTranscriber, RecordingPipeline,
    RecordingState, Transcriber,
};
pub use tts::{ClipDelivery, MockSynthesizer, SpeechSynthesizer, TtsCoordinator};
