//! Per-channel pending mailbox with merge and cooperative cancel.
//!
//! While one processing pass holds a channel's admission lock, newly
//! arriving messages land here instead of waiting on the lock. A channel
//! keeps exactly one merged envelope, not a list: rapid-fire messages are
//! newline-joined into a single pending request, which bounds memory and
//! batches them into one completion.
//!
//! Cancellation is a flag, not forced termination. The holder finishes its
//! in-flight completion, persists the result, and only then drains the
//! mailbox and reprocesses the merged backlog. An earlier design that
//! aborted the in-flight call mid-stream wasted the metered completion and
//! could loop forever; the post-hoc protocol is deliberate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::InboundMessage;

/// A message waiting for the current holder to finish.
#[derive(Debug, Clone)]
pub struct PendingEnvelope {
    /// The merged message. Text accumulates across merges; routing
    /// metadata always comes from the newest arrival.
    pub message: InboundMessage,
    /// When the first message in this envelope was queued.
    pub enqueued_at: Instant,
}

impl PendingEnvelope {
    /// Fold a newer message into this envelope: text concatenates with a
    /// newline, the newer message's metadata wins.
    fn merge_newer(&mut self, newer: InboundMessage) {
        let mut text = std::mem::take(&mut self.message.text);
        text.push('\n');
        text.push_str(&newer.text);
        self.message = newer;
        self.message.text = text;
    }
}

/// Mailbox state for one channel.
struct Mailbox {
    /// The single merged pending envelope, if any.
    pending: Mutex<Option<PendingEnvelope>>,
    /// Set when a message arrives while the channel is being processed;
    /// observed by the holder after its completion call returns.
    cancelled: AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }
}

/// Collection of per-channel mailboxes.
///
/// Thread-safe and cheap to clone. The pending slot is mutated by at most
/// two actors — the admission path appending, the holder draining — and
/// the drain is an atomic take-and-clear, so a concurrently appended
/// envelope is never lost.
#[derive(Clone)]
pub struct ChannelMailboxes {
    mailboxes: Arc<DashMap<String, Arc<Mailbox>>>,
}

impl ChannelMailboxes {
    pub fn new() -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
        }
    }

    /// Queue a message behind the current holder, merging with anything
    /// already pending.
    pub async fn queue_message(&self, channel_id: &str, message: InboundMessage) {
        let mailbox = self.mailbox(channel_id);
        let mut pending = mailbox.pending.lock().await;
        match pending.as_mut() {
            Some(envelope) => envelope.merge_newer(message),
            None => {
                *pending = Some(PendingEnvelope {
                    message,
                    enqueued_at: Instant::now(),
                });
            }
        }
    }

    /// Signal the current holder that newer input has arrived.
    pub fn signal_cancel(&self, channel_id: &str) {
        self.mailbox(channel_id)
            .cancelled
            .store(true, Ordering::Release);
    }

    /// Whether a cancel has been signalled since the last reset.
    pub fn is_cancelled(&self, channel_id: &str) -> bool {
        self.mailbox(channel_id).cancelled.load(Ordering::Acquire)
    }

    /// Clear the cancel flag.
    pub fn reset_cancel(&self, channel_id: &str) {
        self.mailbox(channel_id)
            .cancelled
            .store(false, Ordering::Release);
    }

    /// Whether a channel has a pending envelope.
    pub async fn has_pending(&self, channel_id: &str) -> bool {
        self.mailbox(channel_id).pending.lock().await.is_some()
    }

    /// Atomically take the merged envelope, leaving the mailbox empty.
    pub async fn drain_and_merge(&self, channel_id: &str) -> Option<PendingEnvelope> {
        self.mailbox(channel_id).pending.lock().await.take()
    }

    /// Spawn a background task that removes idle mailboxes.
    pub fn spawn_cleanup_task(self, interval: Duration, name: &'static str) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Remove mailboxes no one else holds a reference to.
                let stale_keys: Vec<_> = self
                    .mailboxes
                    .iter()
                    .filter(|entry| {
                        Arc::strong_count(entry.value()) == 1
                            && !entry.value().cancelled.load(Ordering::Acquire)
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                let mut removed = 0;
                for key in stale_keys {
                    // Re-check before removal; a mailbox with pending work
                    // is never dropped.
                    let mailbox = match self.mailboxes.get(&key) {
                        Some(entry) => Arc::clone(entry.value()),
                        None => continue,
                    };
                    let empty = mailbox
                        .pending
                        .try_lock()
                        .map(|pending| pending.is_none())
                        .unwrap_or(false);
                    if empty {
                        self.mailboxes.remove(&key);
                        removed += 1;
                    }
                }
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.mailboxes.len(),
                        mailboxes = name,
                        "Cleaned up idle mailboxes"
                    );
                }
            }
        });
    }

    fn mailbox(&self, channel_id: &str) -> Arc<Mailbox> {
        self.mailboxes
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }
}

impl Default for ChannelMailboxes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{Attachment, Sender};

    use super::*;

    fn message(channel: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            channel_id: channel.to_string(),
            sender: Sender {
                id: sender.to_string(),
                display_name: None,
            },
            text: text.to_string(),
            attachments: Vec::new(),
            reply_target: format!("{channel}-replies"),
            should_respond: true,
            message_id: format!("msg-{text}"),
            metadata: serde_json::Value::Null,
        }
    }

    // ------------------------------------------------------------------------
    // queue / drain
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn drain_returns_the_queued_message() {
        let mailboxes = ChannelMailboxes::new();
        mailboxes.queue_message("chan", message("chan", "u1", "hello")).await;

        assert!(mailboxes.has_pending("chan").await);
        let envelope = mailboxes.drain_and_merge("chan").await.unwrap();
        assert_eq!(envelope.message.text, "hello");
        assert!(!mailboxes.has_pending("chan").await);
    }

    #[tokio::test]
    async fn drain_empty_mailbox_returns_none() {
        let mailboxes = ChannelMailboxes::new();
        assert!(mailboxes.drain_and_merge("chan").await.is_none());
    }

    #[tokio::test]
    async fn merge_concatenates_text_and_keeps_newest_metadata() {
        let mailboxes = ChannelMailboxes::new();
        let mut first = message("chan", "u1", "first");
        first.attachments = vec![Attachment {
            url: "http://old".to_string(),
            content_type: None,
        }];
        let mut second = message("chan", "u2", "second");
        second.reply_target = "thread-42".to_string();
        second.should_respond = false;

        mailboxes.queue_message("chan", first).await;
        mailboxes.queue_message("chan", second).await;

        let envelope = mailboxes.drain_and_merge("chan").await.unwrap();
        assert_eq!(envelope.message.text, "first\nsecond");
        // Newest message's metadata wins across the board.
        assert_eq!(envelope.message.sender.id, "u2");
        assert_eq!(envelope.message.reply_target, "thread-42");
        assert_eq!(envelope.message.message_id, "msg-second");
        assert!(!envelope.message.should_respond);
        assert!(envelope.message.attachments.is_empty());
    }

    #[tokio::test]
    async fn merge_is_unbounded_in_count_but_single_slot() {
        let mailboxes = ChannelMailboxes::new();
        for n in 0..5 {
            mailboxes
                .queue_message("chan", message("chan", "u1", &format!("m{n}")))
                .await;
        }

        let envelope = mailboxes.drain_and_merge("chan").await.unwrap();
        assert_eq!(envelope.message.text, "m0\nm1\nm2\nm3\nm4");
        assert!(mailboxes.drain_and_merge("chan").await.is_none());
    }

    #[tokio::test]
    async fn channels_have_independent_mailboxes() {
        let mailboxes = ChannelMailboxes::new();
        mailboxes.queue_message("a", message("a", "u1", "for a")).await;

        assert!(!mailboxes.has_pending("b").await);
        assert_eq!(
            mailboxes.drain_and_merge("a").await.unwrap().message.text,
            "for a"
        );
    }

    // ------------------------------------------------------------------------
    // cancel flag
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_flag_roundtrip() {
        let mailboxes = ChannelMailboxes::new();
        assert!(!mailboxes.is_cancelled("chan"));

        mailboxes.signal_cancel("chan");
        assert!(mailboxes.is_cancelled("chan"));

        mailboxes.reset_cancel("chan");
        assert!(!mailboxes.is_cancelled("chan"));
    }

    #[tokio::test]
    async fn cancel_flags_are_per_channel() {
        let mailboxes = ChannelMailboxes::new();
        mailboxes.signal_cancel("a");
        assert!(mailboxes.is_cancelled("a"));
        assert!(!mailboxes.is_cancelled("b"));
    }
}
