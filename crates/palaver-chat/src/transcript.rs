//! Append-only conversation transcript.
//!
//! A message's position in the transcript is its identity: playback and
//! speech delivery address messages by index, so entries are never removed
//! or reordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use palaver_core::{AudioPayload, ChatMessage};

/// Shared conversation history plus the "bot is composing" indicator.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Mutex<Vec<ChatMessage>>,
    composing: AtomicBool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its index.
    pub fn push(&self, message: ChatMessage) -> usize {
        let mut messages = self.lock();
        messages.push(message);
        messages.len() - 1
    }

    /// Attach synthesized speech to an existing message.
    ///
    /// Out-of-range indexes are ignored: a late clip for a slot that never
    /// materialized is dropped, not an error.
    pub fn attach_audio(&self, index: usize, audio: AudioPayload) {
        if let Some(message) = self.lock().get_mut(index) {
            message.audio = Some(audio);
        }
    }

    pub fn get(&self, index: usize) -> Option<ChatMessage> {
        self.lock().get(index).cloned()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn set_composing(&self, composing: bool) {
        self.composing.store(composing, Ordering::Relaxed);
    }

    pub fn is_composing(&self) -> bool {
        self.composing.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChatMessage>> {
        self.messages.lock().expect("transcript mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::Sender;

    #[test]
    fn test_push_returns_stable_indexes() {
        let transcript = Transcript::new();
        assert_eq!(transcript.push(ChatMessage::bot("welcome")), 0);
        assert_eq!(transcript.push(ChatMessage::user("hi")), 1);
        assert_eq!(transcript.push(ChatMessage::bot("hello")), 2);
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.get(1).unwrap().sender, Sender::User);
    }

    #[test]
    fn test_attach_audio_to_existing_message() {
        let transcript = Transcript::new();
        let index = transcript.push(ChatMessage::bot("welcome"));
        transcript.attach_audio(
            index,
            AudioPayload {
                mime: "audio/mpeg".to_string(),
                data: vec![1, 2, 3],
            },
        );
        assert!(transcript.get(index).unwrap().audio.is_some());
    }

    #[test]
    fn test_attach_audio_out_of_range_ignored() {
        let transcript = Transcript::new();
        transcript.attach_audio(
            7,
            AudioPayload {
                mime: "audio/mpeg".to_string(),
                data: vec![1],
            },
        );
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_composing_flag() {
        let transcript = Transcript::new();
        assert!(!transcript.is_composing());
        transcript.set_composing(true);
        assert!(transcript.is_composing());
        transcript.set_composing(false);
        assert!(!transcript.is_composing());
    }
}
