//! Inbound message types shared between the dispatcher and its callers.
//!
//! These mirror what a chat gateway hands us: who spoke, where, and what
//! should happen with the reply. The dispatcher never talks to a chat
//! platform directly; it only consumes these and hands replies to a
//! [`GatewaySender`](crate::gateway::GatewaySender).

use serde::{Deserialize, Serialize};

/// Who sent an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    /// Stable platform identifier for the sender.
    pub id: String,
    /// Human-readable name, when the platform provides one.
    pub display_name: Option<String>,
}

impl Sender {
    /// Label used when attributing a message to its sender.
    ///
    /// Falls back to the raw id when no display name is available.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }
}

/// An attachment reference carried alongside a message.
///
/// The dispatcher treats attachments as opaque routing metadata; fetching
/// or interpreting them is the embedder's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: Option<String>,
}

/// A single inbound chat message presented for admission.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The conversation this message belongs to. One channel id is one
    /// serialization domain: processing is strictly ordered within it.
    pub channel_id: String,
    pub sender: Sender,
    /// Raw message text. Oversized payloads are truncated with a visible
    /// marker before admission.
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Where the reply should be delivered (channel or thread id).
    pub reply_target: String,
    /// Whether this message should trigger a completion, or only be
    /// recorded into history for context.
    pub should_respond: bool,
    /// Source message id assigned by the chat platform.
    pub message_id: String,
    /// Platform-specific extras, passed through untouched.
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_label_prefers_display_name() {
        let sender = Sender {
            id: "u1".to_string(),
            display_name: Some("Ada".to_string()),
        };
        assert_eq!(sender.label(), "Ada");
    }

    #[test]
    fn sender_label_falls_back_to_id() {
        let sender = Sender {
            id: "u1".to_string(),
            display_name: None,
        };
        assert_eq!(sender.label(), "u1");
    }
}
