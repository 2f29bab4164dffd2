//! One-time-code authentication state machine.
//!
//! Valid transitions:
//! - Unauthenticated -> PendingChannelInput (gate engaged)
//! - PendingChannelInput -> OtpSent (code requested)
//! - OtpSent -> OtpSent (resend, after the cooldown elapses)
//! - OtpSent -> Verifying -> Verified (code accepted)
//! - Verifying -> OtpSent (code rejected)
//! - any non-Verified state -> PendingChannelInput (destination changed)
//!
//! The resend cooldown is stored as an absolute deadline in the session
//! store, so a reload mid-countdown reconstructs the remaining time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use palaver_core::clock::Clock;
use palaver_core::config::AuthConfig;
use palaver_core::AuthChannel;
use palaver_storage::SessionStore;

use crate::api::OtpApi;
use crate::error::AuthError;
use crate::keys;

/// Authentication state of the current visitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No gate engaged, no verification in progress.
    Unauthenticated,
    /// Gate engaged; waiting for the user to provide a destination.
    PendingChannelInput,
    /// A code was issued to the destination.
    OtpSent {
        channel: AuthChannel,
        destination: String,
        sent_at: DateTime<Utc>,
    },
    /// A verify call is in flight.
    Verifying {
        channel: AuthChannel,
        destination: String,
    },
    /// Destination proven; messaging is no longer quota-gated.
    Verified {
        channel: AuthChannel,
        destination: String,
    },
}

impl AuthState {
    /// Short state name for logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "Unauthenticated",
            AuthState::PendingChannelInput => "PendingChannelInput",
            AuthState::OtpSent { .. } => "OtpSent",
            AuthState::Verifying { .. } => "Verifying",
            AuthState::Verified { .. } => "Verified",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Drives code request/verify against the OTP endpoints.
pub struct AuthFlow {
    state: Mutex<AuthState>,
    store: Arc<SessionStore>,
    api: Arc<dyn OtpApi>,
    clock: Arc<dyn Clock>,
    cooldown_secs: i64,
    otp_length: usize,
    email_re: Regex,
    phone_re: Regex,
}

impl AuthFlow {
    pub fn new(
        store: Arc<SessionStore>,
        api: Arc<dyn OtpApi>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            state: Mutex::new(AuthState::Unauthenticated),
            store,
            api,
            clock,
            cooldown_secs: config.resend_cooldown_secs,
            otp_length: config.otp_length,
            // Both patterns are static and known-valid.
            email_re: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"),
            phone_re: Regex::new(r"^\d{10}$").expect("phone regex"),
        }
    }

    /// Returns a clone of the current state.
    pub fn state(&self) -> AuthState {
        self.lock().clone()
    }

    pub fn is_verified(&self) -> bool {
        matches!(*self.lock(), AuthState::Verified { .. })
    }

    /// Whether the gate is currently engaged (user must authenticate
    /// before sending more messages).
    pub fn gate_pending(&self) -> bool {
        matches!(
            *self.lock(),
            AuthState::PendingChannelInput | AuthState::OtpSent { .. } | AuthState::Verifying { .. }
        )
    }

    /// The verified contact, if the flow has reached `Verified`.
    pub fn verified_contact(&self) -> Option<(AuthChannel, String)> {
        match &*self.lock() {
            AuthState::Verified {
                channel,
                destination,
            } => Some((*channel, destination.clone())),
            _ => None,
        }
    }

    /// Engage the auth gate and persist the gate flag.
    ///
    /// Forces `PendingChannelInput` from `Unauthenticated` and `Verified`
    /// (the latter only happens on an explicit server demand); states
    /// already inside the flow are left where they are.
    pub fn engage_gate(&self) {
        let mut state = self.lock();
        match &*state {
            AuthState::Unauthenticated | AuthState::Verified { .. } => {
                info!(from = %state, "Auth gate engaged");
                *state = AuthState::PendingChannelInput;
            }
            _ => debug!(state = %state, "Auth gate already engaged"),
        }
        self.store.write_flag(keys::AUTH_GATE, true);
    }

    /// Re-apply persisted auth state on startup or chatbot change.
    ///
    /// Silently restores `Verified` when a cached contact still validates
    /// with the backend; otherwise re-engages the gate if the persisted
    /// flag is set.
    pub async fn restore(&self, preferred: AuthChannel) {
        let other = match preferred {
            AuthChannel::Email => AuthChannel::Whatsapp,
            AuthChannel::Whatsapp => AuthChannel::Email,
        };
        for channel in [preferred, other] {
            let Some(destination) = self.store.verified_contact(channel) else {
                continue;
            };
            match self.api.check_session(channel, &destination).await {
                Ok(true) => {
                    info!(%channel, "Restored verified session");
                    *self.lock() = AuthState::Verified {
                        channel,
                        destination,
                    };
                    self.store.write_flag(keys::AUTH_GATE, false);
                    return;
                }
                Ok(false) => {
                    debug!(%channel, "Cached contact no longer valid");
                    self.store.clear_verified_contact(channel);
                }
                Err(e) => warn!(%channel, error = %e, "Session check failed"),
            }
        }

        if self.store.read_flag(keys::AUTH_GATE) {
            self.engage_gate();
        }
    }

    /// Seconds until a resend is allowed again. Zero when no cooldown is
    /// running.
    pub fn resend_remaining_secs(&self) -> i64 {
        match self.store.read_deadline(keys::RESEND_DEADLINE) {
            Some(deadline) => (deadline - self.clock.now()).num_seconds().max(0),
            None => 0,
        }
    }

    /// Request a one-time code for the destination.
    ///
    /// Validates the destination locally, enforces the resend cooldown
    /// without a network call, then calls the channel's send endpoint and
    /// starts a fresh cooldown.
    pub async fn request_code(
        &self,
        channel: AuthChannel,
        destination: &str,
    ) -> Result<(), AuthError> {
        self.validate_destination(channel, destination)?;

        {
            let state = self.lock();
            if let AuthState::Verifying { .. } | AuthState::Verified { .. } = &*state {
                return Err(AuthError::InvalidTransition {
                    action: "request code",
                    state: state.name(),
                });
            }
        }

        let remaining = self.resend_remaining_secs();
        if remaining > 0 {
            return Err(AuthError::CooldownActive {
                remaining_secs: remaining,
            });
        }

        self.api.send_code(channel, destination).await?;

        let now = self.clock.now();
        self.store
            .write_deadline(keys::RESEND_DEADLINE, now + Duration::seconds(self.cooldown_secs));
        info!(%channel, "One-time code issued");
        *self.lock() = AuthState::OtpSent {
            channel,
            destination: destination.to_string(),
            sent_at: now,
        };
        Ok(())
    }

    /// Verify a one-time code.
    ///
    /// Codes of the wrong shape are rejected locally without a network
    /// call. On success the verified contact is persisted, the gate flag
    /// and quota counter are cleared, and the flow lands in `Verified`.
    /// A rejected code returns the flow to `OtpSent`.
    pub async fn verify_code(&self, code: &str) -> Result<(), AuthError> {
        if code.len() != self.otp_length || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::InvalidCode(self.otp_length));
        }

        let (channel, destination, sent_at) = {
            let mut state = self.lock();
            match state.clone() {
                AuthState::OtpSent {
                    channel,
                    destination,
                    sent_at,
                } => {
                    *state = AuthState::Verifying {
                        channel,
                        destination: destination.clone(),
                    };
                    (channel, destination, sent_at)
                }
                other => {
                    return Err(AuthError::InvalidTransition {
                        action: "verify code",
                        state: other.name(),
                    })
                }
            }
        };

        let result = self.api.verify_code(channel, &destination, code).await;
        match result {
            Ok(true) => {
                info!(%channel, "Destination verified");
                self.store.set_verified_contact(channel, &destination);
                self.store.write_flag(keys::AUTH_GATE, false);
                self.store.write_counter(keys::FREE_MESSAGES_USED, 0);
                self.store.clear_deadline(keys::RESEND_DEADLINE);
                *self.lock() = AuthState::Verified {
                    channel,
                    destination,
                };
                Ok(())
            }
            Ok(false) => {
                debug!(%channel, "Code rejected");
                *self.lock() = AuthState::OtpSent {
                    channel,
                    destination,
                    sent_at,
                };
                Err(AuthError::CodeRejected)
            }
            Err(e) => {
                warn!(%channel, error = %e, "Verify call failed");
                *self.lock() = AuthState::OtpSent {
                    channel,
                    destination,
                    sent_at,
                };
                Err(e)
            }
        }
    }

    /// The user edited the destination; fall back to channel input.
    ///
    /// `Verified` is never regressed by a destination change. The resend
    /// cooldown keeps running: it bounds code issuance, not UI state.
    pub fn change_destination(&self) {
        let mut state = self.lock();
        if !matches!(*state, AuthState::Verified { .. }) {
            debug!(from = %state, "Destination changed, awaiting channel input");
            *state = AuthState::PendingChannelInput;
        }
    }

    fn validate_destination(
        &self,
        channel: AuthChannel,
        destination: &str,
    ) -> Result<(), AuthError> {
        let valid = match channel {
            AuthChannel::Email => self.email_re.is_match(destination),
            AuthChannel::Whatsapp => self.phone_re.is_match(destination),
        };
        if valid {
            Ok(())
        } else {
            Err(AuthError::InvalidDestination {
                channel,
                destination: destination.to_string(),
            })
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthState> {
        // A poisoned auth state is unrecoverable in-process; the mutex is
        // never held across await points.
        self.state.lock().expect("auth state mutex poisoned")
    }
}

impl std::fmt::Debug for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFlow")
            .field("state", &self.state)
            .field("cooldown_secs", &self.cooldown_secs)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockOtpApi;
    use palaver_core::clock::ManualClock;

    struct Fixture {
        flow: AuthFlow,
        api: Arc<MockOtpApi>,
        clock: Arc<ManualClock>,
        store: Arc<SessionStore>,
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(SessionStore::in_memory("bot-1")))
    }

    fn fixture_with_store(store: Arc<SessionStore>) -> Fixture {
        let api = Arc::new(MockOtpApi::accepting("123456"));
        let clock = Arc::new(ManualClock::default());
        let flow = AuthFlow::new(
            Arc::clone(&store),
            Arc::clone(&api) as Arc<dyn OtpApi>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            &AuthConfig::default(),
        );
        Fixture {
            flow,
            api,
            clock,
            store,
        }
    }

    // ---- Initial state and gate ----

    #[test]
    fn test_initial_state_unauthenticated() {
        let f = fixture();
        assert_eq!(f.flow.state(), AuthState::Unauthenticated);
        assert!(!f.flow.gate_pending());
        assert!(!f.flow.is_verified());
    }

    #[test]
    fn test_engage_gate_persists_flag() {
        let f = fixture();
        f.flow.engage_gate();
        assert_eq!(f.flow.state(), AuthState::PendingChannelInput);
        assert!(f.flow.gate_pending());
        assert!(f.store.read_flag(keys::AUTH_GATE));
    }

    #[tokio::test]
    async fn test_engage_gate_does_not_regress_otp_sent() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();
        f.flow.engage_gate();
        assert!(matches!(f.flow.state(), AuthState::OtpSent { .. }));
    }

    // ---- Destination validation ----

    #[tokio::test]
    async fn test_invalid_email_rejected_without_network() {
        let f = fixture();
        f.flow.engage_gate();
        let result = f.flow.request_code(AuthChannel::Email, "not-an-email").await;
        assert!(matches!(result, Err(AuthError::InvalidDestination { .. })));
        assert_eq!(f.api.send_count(), 0);
        assert_eq!(f.flow.state(), AuthState::PendingChannelInput);
    }

    #[tokio::test]
    async fn test_invalid_phone_rejected() {
        let f = fixture();
        f.flow.engage_gate();
        for bad in ["12345", "123456789012", "555-123-4567", "abcdefghij"] {
            let result = f.flow.request_code(AuthChannel::Whatsapp, bad).await;
            assert!(
                matches!(result, Err(AuthError::InvalidDestination { .. })),
                "{} should be invalid",
                bad
            );
        }
        assert_eq!(f.api.send_count(), 0);
    }

    #[tokio::test]
    async fn test_valid_phone_accepted() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Whatsapp, "5551234567")
            .await
            .unwrap();
        assert!(matches!(f.flow.state(), AuthState::OtpSent { .. }));
    }

    // ---- Resend cooldown ----

    #[tokio::test]
    async fn test_resend_within_cooldown_rejected_without_network() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();
        assert_eq!(f.api.send_count(), 1);

        f.clock.advance(Duration::seconds(30));
        let result = f.flow.request_code(AuthChannel::Email, "a@b.com").await;
        match result {
            Err(AuthError::CooldownActive { remaining_secs }) => {
                assert_eq!(remaining_secs, 30);
            }
            other => panic!("expected CooldownActive, got {:?}", other),
        }
        // No second network call was made.
        assert_eq!(f.api.send_count(), 1);
    }

    #[tokio::test]
    async fn test_resend_after_cooldown_succeeds() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        f.clock.advance(Duration::seconds(61));
        assert_eq!(f.flow.resend_remaining_secs(), 0);
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();
        assert_eq!(f.api.send_count(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_survives_reload() {
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        let f = fixture_with_store(Arc::clone(&store));
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        // Simulate a reload: a fresh flow over the same store, with a clock
        // that has moved on by 20 wall-clock seconds.
        let api = Arc::new(MockOtpApi::default());
        let clock = Arc::new(ManualClock::default());
        clock.advance(Duration::seconds(20));
        let reloaded = AuthFlow::new(
            store,
            api as Arc<dyn OtpApi>,
            clock as Arc<dyn Clock>,
            &AuthConfig::default(),
        );

        let remaining = reloaded.resend_remaining_secs();
        // Reconstructed from the persisted absolute deadline, not reset.
        assert!(remaining > 0 && remaining <= 40, "remaining = {}", remaining);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_state_and_cooldown_untouched() {
        let f = fixture();
        f.flow.engage_gate();
        f.api.set_fail_sends(true);
        let result = f.flow.request_code(AuthChannel::Email, "a@b.com").await;
        assert!(matches!(result, Err(AuthError::Network(_))));
        assert_eq!(f.flow.state(), AuthState::PendingChannelInput);
        assert_eq!(f.flow.resend_remaining_secs(), 0);
    }

    // ---- Verification ----

    #[tokio::test]
    async fn test_short_code_rejected_locally() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        let result = f.flow.verify_code("12345").await;
        assert!(matches!(result, Err(AuthError::InvalidCode(6))));
        // No verify endpoint call was made.
        assert_eq!(f.api.verify_count(), 0);
        assert!(matches!(f.flow.state(), AuthState::OtpSent { .. }));
    }

    #[tokio::test]
    async fn test_non_digit_code_rejected_locally() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();
        let result = f.flow.verify_code("12a456").await;
        assert!(matches!(result, Err(AuthError::InvalidCode(_))));
        assert_eq!(f.api.verify_count(), 0);
    }

    #[tokio::test]
    async fn test_correct_code_verifies_and_clears_persisted_state() {
        let f = fixture();
        f.store.write_counter(keys::FREE_MESSAGES_USED, 3);
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        f.flow.verify_code("123456").await.unwrap();

        assert!(f.flow.is_verified());
        assert_eq!(
            f.flow.verified_contact(),
            Some((AuthChannel::Email, "a@b.com".to_string()))
        );
        // Quota reset, gate flag cleared, contact cached.
        assert_eq!(f.store.read_counter(keys::FREE_MESSAGES_USED), 0);
        assert!(!f.store.read_flag(keys::AUTH_GATE));
        assert_eq!(
            f.store.verified_contact(AuthChannel::Email).as_deref(),
            Some("a@b.com")
        );
    }

    #[tokio::test]
    async fn test_wrong_code_returns_to_otp_sent() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        let result = f.flow.verify_code("000000").await;
        assert!(matches!(result, Err(AuthError::CodeRejected)));
        assert!(matches!(f.flow.state(), AuthState::OtpSent { .. }));

        // No client-side attempt limit: trying again with the right code works.
        f.flow.verify_code("123456").await.unwrap();
        assert!(f.flow.is_verified());
    }

    #[tokio::test]
    async fn test_verify_without_otp_sent_rejected() {
        let f = fixture();
        let result = f.flow.verify_code("123456").await;
        assert!(matches!(result, Err(AuthError::InvalidTransition { .. })));
        assert_eq!(f.api.verify_count(), 0);
    }

    // ---- Destination change ----

    #[tokio::test]
    async fn test_change_destination_resets_to_pending() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();

        f.flow.change_destination();
        assert_eq!(f.flow.state(), AuthState::PendingChannelInput);
    }

    #[tokio::test]
    async fn test_change_destination_never_regresses_verified() {
        let f = fixture();
        f.flow.engage_gate();
        f.flow
            .request_code(AuthChannel::Email, "a@b.com")
            .await
            .unwrap();
        f.flow.verify_code("123456").await.unwrap();

        f.flow.change_destination();
        assert!(f.flow.is_verified());
    }

    // ---- Restore ----

    #[tokio::test]
    async fn test_restore_reapplies_persisted_gate_flag() {
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        store.write_flag(keys::AUTH_GATE, true);
        let f = fixture_with_store(store);

        f.flow.restore(AuthChannel::Email).await;
        assert_eq!(f.flow.state(), AuthState::PendingChannelInput);
    }

    #[tokio::test]
    async fn test_restore_silently_recovers_verified_session() {
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        store.set_verified_contact(AuthChannel::Email, "a@b.com");
        store.write_flag(keys::AUTH_GATE, true);
        let f = fixture_with_store(store);
        f.api.set_session_valid(true);

        f.flow.restore(AuthChannel::Email).await;
        assert!(f.flow.is_verified());
        assert!(!f.store.read_flag(keys::AUTH_GATE));
    }

    #[tokio::test]
    async fn test_restore_drops_stale_contact() {
        let store = Arc::new(SessionStore::in_memory("bot-1"));
        store.set_verified_contact(AuthChannel::Email, "a@b.com");
        let f = fixture_with_store(store);
        // check_session returns false by default.

        f.flow.restore(AuthChannel::Email).await;
        assert!(!f.flow.is_verified());
        assert!(f.store.verified_contact(AuthChannel::Email).is_none());
    }

    #[tokio::test]
    async fn test_restore_without_state_is_noop() {
        let f = fixture();
        f.flow.restore(AuthChannel::Email).await;
        assert_eq!(f.flow.state(), AuthState::Unauthenticated);
    }

    // ---- Display ----

    #[test]
    fn test_state_names() {
        assert_eq!(AuthState::Unauthenticated.to_string(), "Unauthenticated");
        assert_eq!(
            AuthState::PendingChannelInput.to_string(),
            "PendingChannelInput"
        );
    }
}
