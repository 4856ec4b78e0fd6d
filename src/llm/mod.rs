//! Completion backend interface and chat types.
//!
//! The backend itself — prompt construction details, streaming transport,
//! provider retries — lives outside this crate. The dispatcher only needs
//! a way to turn a conversation's history into one completion.

mod error;

pub use error::LlmError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Chat Types
// ============================================================================

/// A message in a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The role of a message author.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, passed through uninterpreted.
    pub arguments: String,
}

// ============================================================================
// Requests / Responses
// ============================================================================

/// One completion request built from a channel's state.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub channel_id: String,
    /// Full conversation history, oldest first, ending with the message
    /// being processed.
    pub messages: Vec<Message>,
    /// Whether the backend should stream. Streaming backends still return
    /// the assembled final text here.
    pub stream: bool,
}

/// What a completion produced.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    /// Provider metadata (token usage, model name), passed through.
    pub metadata: serde_json::Value,
    /// Tool calls the model requested; execution is the embedder's concern.
    pub tool_calls: Vec<ToolCall>,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// The expensive call this whole crate exists to guard.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Run one completion. Carries its own caller-side timeout; the
    /// dispatcher never force-cancels an in-flight call.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Circuit-breaker style pre-check consulted before any completion call.
///
/// When this returns `false` the dispatcher refuses admission outright
/// instead of queueing work a degraded backend cannot absorb.
pub trait BackendGate: Send + Sync {
    fn can_execute(&self) -> bool;
}

/// A gate that always admits. The default when no breaker is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl BackendGate for AlwaysOpen {
    fn can_execute(&self) -> bool {
        true
    }
}
