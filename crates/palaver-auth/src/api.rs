//! Port for the channel-specific OTP endpoints.
//!
//! The backend exposes separate email and WhatsApp routes; implementations
//! select the route from the channel argument. A mock implementation lives
//! here so flow tests never touch the network.

use async_trait::async_trait;

use palaver_core::AuthChannel;

use crate::error::AuthError;

/// One-time-code issuance and verification endpoints.
#[async_trait]
pub trait OtpApi: Send + Sync {
    /// Issue a code to the destination over the given channel.
    async fn send_code(&self, channel: AuthChannel, destination: &str) -> Result<(), AuthError>;

    /// Verify a code. `Ok(false)` means the server rejected the code.
    async fn verify_code(
        &self,
        channel: AuthChannel,
        destination: &str,
        code: &str,
    ) -> Result<bool, AuthError>;

    /// Check whether a previously verified identity is still valid.
    async fn check_session(
        &self,
        channel: AuthChannel,
        destination: &str,
    ) -> Result<bool, AuthError>;
}

/// Mock OTP backend for tests.
///
/// Accepts one configured code, counts calls, and can be made to fail
/// sends to exercise error paths.
#[derive(Debug)]
pub struct MockOtpApi {
    accepted_code: String,
    session_valid: std::sync::atomic::AtomicBool,
    fail_sends: std::sync::atomic::AtomicBool,
    pub send_calls: std::sync::atomic::AtomicUsize,
    pub verify_calls: std::sync::atomic::AtomicUsize,
    pub check_calls: std::sync::atomic::AtomicUsize,
}

impl MockOtpApi {
    pub fn accepting(code: &str) -> Self {
        Self {
            accepted_code: code.to_string(),
            session_valid: std::sync::atomic::AtomicBool::new(false),
            fail_sends: std::sync::atomic::AtomicBool::new(false),
            send_calls: std::sync::atomic::AtomicUsize::new(0),
            verify_calls: std::sync::atomic::AtomicUsize::new(0),
            check_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set_session_valid(&self, valid: bool) {
        self.session_valid
            .store(valid, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn send_count(&self) -> usize {
        self.send_calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for MockOtpApi {
    fn default() -> Self {
        Self::accepting("123456")
    }
}

#[async_trait]
impl OtpApi for MockOtpApi {
    async fn send_code(&self, channel: AuthChannel, destination: &str) -> Result<(), AuthError> {
        self.send_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self.fail_sends.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(AuthError::Network("send failed".to_string()));
        }
        tracing::debug!(%channel, destination, "Mock OTP sent");
        Ok(())
    }

    async fn verify_code(
        &self,
        _channel: AuthChannel,
        _destination: &str,
        code: &str,
    ) -> Result<bool, AuthError> {
        self.verify_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(code == self.accepted_code)
    }

    async fn check_session(
        &self,
        _channel: AuthChannel,
        _destination: &str,
    ) -> Result<bool, AuthError> {
        self.check_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(self.session_valid.load(std::sync::atomic::Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_accepts_configured_code() {
        let api = MockOtpApi::accepting("654321");
        api.send_code(AuthChannel::Email, "a@b.com").await.unwrap();
        assert!(api
            .verify_code(AuthChannel::Email, "a@b.com", "654321")
            .await
            .unwrap());
        assert!(!api
            .verify_code(AuthChannel::Email, "a@b.com", "000000")
            .await
            .unwrap());
        assert_eq!(api.send_count(), 1);
        assert_eq!(api.verify_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_failing_sends() {
        let api = MockOtpApi::default();
        api.set_fail_sends(true);
        let result = api.send_code(AuthChannel::Whatsapp, "5551234567").await;
        assert!(matches!(result, Err(AuthError::Network(_))));
    }

    #[tokio::test]
    async fn test_mock_session_check() {
        let api = MockOtpApi::default();
        assert!(!api
            .check_session(AuthChannel::Email, "a@b.com")
            .await
            .unwrap());
        api.set_session_valid(true);
        assert!(api
            .check_session(AuthChannel::Email, "a@b.com")
            .await
            .unwrap());
    }
}
