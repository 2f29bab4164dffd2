//! Progressive authentication for the widget runtime.
//!
//! `QuotaGate` decides whether a message may be sent without verification;
//! `AuthFlow` drives the one-time-code request/verify state machine with a
//! persisted resend cooldown.

pub mod api;
pub mod error;
pub mod flow;
pub mod quota;

pub use api::{MockOtpApi, OtpApi};
pub use error::AuthError;
pub use flow::{AuthFlow, AuthState};
pub use quota::QuotaGate;

/// Persisted key names shared between the gate and the flow.
pub(crate) mod keys {
    /// Free messages already consumed in this session.
    pub const FREE_MESSAGES_USED: &str = "free_messages_used";
    /// Auth gate engaged in a previous page load.
    pub const AUTH_GATE: &str = "auth_gate";
    /// Absolute resend-cooldown deadline.
    pub const RESEND_DEADLINE: &str = "resend_deadline";
}
