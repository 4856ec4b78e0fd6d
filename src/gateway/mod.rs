//! Channel-facing surface: the dispatcher, its mailboxes, and the traits
//! it uses to talk back to the chat platform.

pub mod handler;
pub mod queue;

pub use handler::{DispatcherDeps, MessageDispatcher};
pub use queue::{ChannelMailboxes, PendingEnvelope};

use async_trait::async_trait;
use thiserror::Error;

/// Error delivering text to the chat platform.
#[derive(Debug, Error)]
#[error("delivery to '{target}' failed: {message}")]
pub struct SendError {
    pub target: String,
    pub message: String,
}

impl SendError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Delivers dispatcher output back to the outside world.
///
/// Errors are reported to the user as a generic failure and never retried
/// automatically by this crate.
#[async_trait]
pub trait GatewaySender: Send + Sync {
    /// Deliver text to a target; returns the platform's message id.
    async fn deliver(&self, target: &str, text: &str) -> Result<String, SendError>;

    /// Best-effort typing indicator shown while a completion runs.
    async fn send_typing(&self, _target: &str) -> Result<(), SendError> {
        Ok(())
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processed to completion; the reply was delivered.
    Completed,
    /// Recorded into history without triggering a completion.
    Recorded,
    /// Queued behind the current holder, which will merge and pick it up.
    Queued,
    /// An identical request is already in flight; dropped silently.
    Duplicate,
    /// Lock wait exceeded its bound; the caller was told to retry later.
    Busy,
    /// The backend gate refused execution.
    Degraded,
    /// Processing failed; a generic notice was delivered.
    Failed,
}
