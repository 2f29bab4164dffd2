//! Playback arbitration for synthesized speech clips.
//!
//! At most one decodable audio resource exists at a time. Requesting
//! playback of the clip that is already active toggles it off; requesting a
//! different clip stops and releases the current one before the new one is
//! decoded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use palaver_core::AudioPayload;

use crate::error::VoiceError;

/// Decodes encoded audio payloads into playable clips.
pub trait ClipPlayer: Send + Sync {
    fn decode(&self, payload: &AudioPayload) -> Result<Box<dyn DecodedClip>, VoiceError>;
}

/// A decoded audio resource. Exactly one exists at a time; `stop` releases
/// the underlying buffer and must be safe to call more than once.
pub trait DecodedClip: Send {
    fn play(&mut self, muted: bool) -> Result<(), VoiceError>;
    /// Apply mute without interrupting the playback position.
    fn set_muted(&mut self, muted: bool);
    fn stop(&mut self);
}

/// Ensures single-clip playback keyed by message index.
pub struct AudioArbiter {
    player: Arc<dyn ClipPlayer>,
    active: Mutex<Option<(usize, Box<dyn DecodedClip>)>>,
    muted: AtomicBool,
}

impl AudioArbiter {
    pub fn new(player: Arc<dyn ClipPlayer>) -> Self {
        Self {
            player,
            active: Mutex::new(None),
            muted: AtomicBool::new(false),
        }
    }

    /// The message index of the clip currently playing, if any.
    pub fn active_clip(&self) -> Option<usize> {
        self.lock().as_ref().map(|(index, _)| *index)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Start, toggle off, or switch playback.
    ///
    /// Decode or playback-start failures leave no clip active; the
    /// conversation continues without audio.
    pub fn play(&self, payload: &AudioPayload, message_index: usize) -> Result<(), VoiceError> {
        let mut active = self.lock();

        // Toggle-off: same message requested again.
        if let Some((index, _)) = active.as_ref() {
            if *index == message_index {
                if let Some((_, mut clip)) = active.take() {
                    clip.stop();
                }
                debug!(message_index, "Playback toggled off");
                return Ok(());
            }
        }

        // Release the current clip before the next one is decoded, so two
        // decoded resources never coexist.
        if let Some((index, mut clip)) = active.take() {
            debug!(from = index, to = message_index, "Switching active clip");
            clip.stop();
        }

        let mut clip = self.player.decode(payload).inspect_err(|e| {
            warn!(message_index, error = %e, "Clip decode failed");
        })?;

        if let Err(e) = clip.play(self.is_muted()) {
            warn!(message_index, error = %e, "Playback start failed");
            clip.stop();
            return Err(e);
        }

        *active = Some((message_index, clip));
        Ok(())
    }

    /// Called when the active clip finishes playing naturally.
    pub fn on_playback_complete(&self, message_index: usize) {
        let mut active = self.lock();
        if let Some((index, _)) = active.as_ref() {
            if *index == message_index {
                if let Some((_, mut clip)) = active.take() {
                    clip.stop();
                }
            }
        }
    }

    /// Stop and release the active clip, if any.
    pub fn stop(&self) {
        if let Some((_, mut clip)) = self.lock().take() {
            clip.stop();
        }
    }

    /// Update the mute flag, applying it to the active clip in place.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        if let Some((_, clip)) = self.lock().as_mut() {
            clip.set_muted(muted);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(usize, Box<dyn DecodedClip>)>> {
        self.active.lock().expect("arbiter mutex poisoned")
    }
}

impl std::fmt::Debug for AudioArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArbiter")
            .field("active_clip", &self.active_clip())
            .field("muted", &self.is_muted())
            .finish()
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Mock player for tests: tracks how many decoded resources are alive so
/// the single-resource invariant can be asserted.
#[derive(Debug, Default)]
pub struct MockClipPlayer {
    live: Arc<std::sync::atomic::AtomicUsize>,
    decoded_total: Arc<std::sync::atomic::AtomicUsize>,
    fail_decode: AtomicBool,
}

impl MockClipPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded resources currently alive (not yet released).
    pub fn live_clips(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Total decode calls that succeeded.
    pub fn decoded_total(&self) -> usize {
        self.decoded_total.load(Ordering::Relaxed)
    }

    pub fn set_fail_decode(&self, fail: bool) {
        self.fail_decode.store(fail, Ordering::Relaxed);
    }
}

impl ClipPlayer for MockClipPlayer {
    fn decode(&self, payload: &AudioPayload) -> Result<Box<dyn DecodedClip>, VoiceError> {
        if self.fail_decode.load(Ordering::Relaxed) {
            return Err(VoiceError::Decode("mock decode failure".to_string()));
        }
        if payload.is_empty() {
            return Err(VoiceError::Decode("empty payload".to_string()));
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.decoded_total.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockClip {
            live: Arc::clone(&self.live),
            released: false,
            playing: false,
            muted: false,
        }))
    }
}

struct MockClip {
    live: Arc<std::sync::atomic::AtomicUsize>,
    released: bool,
    playing: bool,
    muted: bool,
}

impl DecodedClip for MockClip {
    fn play(&mut self, muted: bool) -> Result<(), VoiceError> {
        self.playing = true;
        self.muted = muted;
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn stop(&mut self) {
        self.playing = false;
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for MockClip {
    fn drop(&mut self) {
        // Dropping without an explicit stop still frees the resource.
        self.stop();
    }
}

// =============================================================================
// Tests
// =============================================================================
