//! LLM backend abstraction.
//!
//! The agent only needs one operation from a backend: turn an ordered list of
//! role/content messages into generated text. Backends that stream report each
//! fragment through a callback as it arrives, but the call only returns once
//! the response is complete.

mod remote;

pub use remote::{BackendMode, HealthStatus, RemoteLlmClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A chat message as sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Optional sampling parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationOptions {
    #[serde(rename = "num_predict", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        self.max_tokens.is_none() && self.temperature.is_none()
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
    pub stream: bool,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend returned an empty response")]
    EmptyResponse,

    #[error("Could not decode backend response: {0}")]
    Decode(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// A language-model backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a complete response for `request`.
    ///
    /// `on_fragment` is called with each piece of text in order as it
    /// arrives. The returned string is the concatenation of all fragments.
    async fn complete(
        &self,
        request: &ModelRequest,
        on_fragment: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, LlmError>;
}
