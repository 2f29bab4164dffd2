//! Free-message quota gate.
//!
//! Decides whether a message may proceed without authentication. The used
//! counter lives in the `SessionStore` so it survives reloads; `exhausted`
//! is always derived from `used >= limit`, never stored separately.

use std::sync::Arc;

use tracing::info;

use palaver_storage::SessionStore;

use crate::keys;

/// Gate over the configured free-message allowance.
///
/// Verified sessions never consult this; the dispatcher checks verification
/// first.
#[derive(Debug, Clone)]
pub struct QuotaGate {
    store: Arc<SessionStore>,
    limit: u32,
}

impl QuotaGate {
    pub fn new(store: Arc<SessionStore>, limit: u32) -> Self {
        Self { store, limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Free messages already consumed in this session.
    pub fn used(&self) -> u32 {
        self.store.read_counter(keys::FREE_MESSAGES_USED)
    }

    /// Whether the allowance is spent. A limit of zero gates immediately.
    pub fn exhausted(&self) -> bool {
        self.used() >= self.limit
    }

    /// Whether the next message may be sent without authentication.
    pub fn can_send_free_message(&self) -> bool {
        !self.exhausted()
    }

    /// Record a sent free message.
    ///
    /// Returns `true` when the new usage reaches the limit, meaning the
    /// auth gate must now engage.
    pub fn record_free_message_sent(&self) -> bool {
        let used = self.used().saturating_add(1);
        self.store.write_counter(keys::FREE_MESSAGES_USED, used);
        let reached = used >= self.limit;
        if reached {
            info!(used, limit = self.limit, "Free-message quota exhausted");
        }
        reached
    }

    /// Zero the usage counter. Called only after successful verification.
    pub fn reset(&self) {
        self.store.write_counter(keys::FREE_MESSAGES_USED, 0);
    }
}
