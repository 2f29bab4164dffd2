//! Conversation orchestration: the transcript, the message dispatcher that
//! gates sends against quota and authentication, the HTTP backend client,
//! and the session wiring that assembles every component for an embedding
//! host.

pub mod api;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod session;
pub mod transcript;

pub use api::{ChatApi, ConfigApi, MockChatApi, QueryRequest, QueryResponse};
pub use dispatch::{MessageDispatcher, SendOutcome};
pub use error::ApiError;
pub use http::HttpBackend;
pub use session::{SessionDeps, WidgetSession};
pub use transcript::Transcript;
