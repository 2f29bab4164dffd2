//! Hardware ports for a terminal host.
//!
//! A terminal has no audio output or capture device, so playback is a
//! logged no-op and microphone acquisition reports a permission failure.
//! The rest of the runtime degrades gracefully around both.

use async_trait::async_trait;
use tracing::debug;

use palaver_core::AudioPayload;
use palaver_voice::{CaptureStream, ClipPlayer, DecodedClip, MicrophoneSource, VoiceError};

/// Accepts clips and discards them.
#[derive(Debug, Default)]
pub struct SilentPlayer;

impl ClipPlayer for SilentPlayer {
    fn decode(&self, payload: &AudioPayload) -> Result<Box<dyn DecodedClip>, VoiceError> {
        if payload.is_empty() {
            return Err(VoiceError::Decode("empty payload".to_string()));
        }
        Ok(Box::new(SilentClip {
            bytes: payload.data.len(),
        }))
    }
}

struct SilentClip {
    bytes: usize,
}

impl DecodedClip for SilentClip {
    fn play(&mut self, muted: bool) -> Result<(), VoiceError> {
        debug!(bytes = self.bytes, muted, "Discarding clip (no audio device)");
        Ok(())
    }

    fn set_muted(&mut self, _muted: bool) {}

    fn stop(&mut self) {}
}

/// A host with no capture device.
#[derive(Debug, Default)]
pub struct NoMicrophone;

#[async_trait]
impl MicrophoneSource for NoMicrophone {
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, VoiceError> {
        Err(VoiceError::PermissionDenied(
            "no capture device available".to_string(),
        ))
    }
}
