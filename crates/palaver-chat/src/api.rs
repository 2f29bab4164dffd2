//! Ports for the chat-query and chatbot-config endpoints.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use palaver_core::{AudioPayload, ChatbotConfig};

use crate::error::ApiError;

/// Request body of the chat-query endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub chatbot_id: String,
    pub query: String,
    pub session_id: String,
    /// Verified email, sent when the session authenticated over email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Verified phone number, sent when authenticated over WhatsApp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// A successful chat-query response.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub answer: String,
    /// Server-synthesized speech for the answer, already decoded.
    pub audio: Option<AudioPayload>,
    /// The server demands authentication before the next message.
    pub requires_auth_next: bool,
    /// Channel the server wants authentication over, when it says so.
    pub auth_method: Option<String>,
}

/// The chat-query endpoint.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, ApiError>;
}

/// The per-chatbot configuration endpoint.
#[async_trait]
pub trait ConfigApi: Send + Sync {
    async fn fetch_config(&self, chatbot_id: &str) -> Result<ChatbotConfig, ApiError>;
}

// =============================================================================
// Mock implementation
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum MockFailure {
    AuthRequired,
    Network,
}

/// Mock chat backend for dispatcher and session tests.
///
/// Answers with a fixed response, counts calls, records the last request,
/// and can be switched into a failure mode.
pub struct MockChatApi {
    response: Mutex<QueryResponse>,
    failure: Mutex<Option<MockFailure>>,
    auth_method: Mutex<Option<String>>,
    config: Mutex<ChatbotConfig>,
    fail_config: AtomicBool,
    query_calls: AtomicUsize,
    last_request: Mutex<Option<QueryRequest>>,
}

impl MockChatApi {
    pub fn answering(answer: &str) -> Self {
        Self {
            response: Mutex::new(QueryResponse {
                answer: answer.to_string(),
                ..QueryResponse::default()
            }),
            failure: Mutex::new(None),
            auth_method: Mutex::new(None),
            config: Mutex::new(ChatbotConfig::default()),
            fail_config: AtomicBool::new(false),
            query_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn set_response(&self, response: QueryResponse) {
        *self.response.lock().expect("mock mutex poisoned") = response;
    }

    /// Subsequent queries fail with a 403 auth-required response.
    pub fn set_auth_required(&self, auth_method: Option<&str>) {
        *self.failure.lock().expect("mock mutex poisoned") = Some(MockFailure::AuthRequired);
        *self.auth_method.lock().expect("mock mutex poisoned") =
            auth_method.map(|m| m.to_string());
    }

    /// Subsequent queries fail with a network error.
    pub fn set_network_failure(&self, fail: bool) {
        *self.failure.lock().expect("mock mutex poisoned") =
            fail.then_some(MockFailure::Network);
    }

    pub fn set_config(&self, config: ChatbotConfig) {
        *self.config.lock().expect("mock mutex poisoned") = config;
    }

    pub fn set_fail_config(&self, fail: bool) {
        self.fail_config.store(fail, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> usize {
        self.query_calls.load(Ordering::Relaxed)
    }

    pub fn last_request(&self) -> Option<QueryRequest> {
        self.last_request.lock().expect("mock mutex poisoned").clone()
    }
}

impl Default for MockChatApi {
    fn default() -> Self {
        Self::answering("mock answer")
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, ApiError> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        *self.last_request.lock().expect("mock mutex poisoned") = Some(request.clone());
        match *self.failure.lock().expect("mock mutex poisoned") {
            Some(MockFailure::AuthRequired) => Err(ApiError::AuthRequired {
                auth_method: self.auth_method.lock().expect("mock mutex poisoned").clone(),
            }),
            Some(MockFailure::Network) => Err(ApiError::Network("mock outage".to_string())),
            None => Ok(self.response.lock().expect("mock mutex poisoned").clone()),
        }
    }
}

#[async_trait]
impl ConfigApi for MockChatApi {
    async fn fetch_config(&self, _chatbot_id: &str) -> Result<ChatbotConfig, ApiError> {
        if self.fail_config.load(Ordering::Relaxed) {
            return Err(ApiError::Network("mock outage".to_string()));
        }
        Ok(self.config.lock().expect("mock mutex poisoned").clone())
    }
}
