//! Message dispatcher: the admission protocol in front of the completion
//! backend.
//!
//! One inbound message flows dedup gate → backend gate → admission lock,
//! then either becomes the channel's active processing pass or is merged
//! into the channel's pending mailbox for the current holder to pick up.
//! The holder loops: complete, persist, check the cancel flag, and either
//! deliver or reprocess the merged backlog — all under the same lock.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::dedup::{RequestDeduplicator, fingerprint};
use crate::llm::{BackendGate, CompletionBackend, CompletionRequest, Message, Role};
use crate::protocol::InboundMessage;
use crate::session::{Session, SessionMap};
use crate::stats::PerfTracker;
use crate::store::SessionPersistence;
use crate::sync::{ChannelLocks, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_IDLE_AGE};

use super::queue::{ChannelMailboxes, PendingEnvelope};
use super::{DispatchOutcome, GatewaySender};

// ============================================================================
// User-Facing Notices
// ============================================================================

// One short, generic notice per failure class. Internal causes are logged,
// never echoed back to the end user.
const BUSY_NOTICE: &str = "I'm still working on an earlier message — try again in a moment.";
const DEGRADED_NOTICE: &str = "Service is temporarily degraded. Please try again shortly.";
const FAILURE_NOTICE: &str = "Something went wrong while generating a response.";

/// Marker appended when an oversized payload is cut down before admission.
const TRUNCATION_MARKER: &str = " [truncated]";

// ============================================================================
// Dispatcher
// ============================================================================

/// External collaborators the dispatcher is wired to at construction.
pub struct DispatcherDeps {
    pub backend: Arc<dyn CompletionBackend>,
    pub gate: Arc<dyn BackendGate>,
    pub persistence: Arc<dyn SessionPersistence>,
    pub sender: Arc<dyn GatewaySender>,
}

/// The request entry point: admits, serializes, and processes messages
/// per channel, merging whatever arrives while a pass is in flight.
pub struct MessageDispatcher {
    config: Config,
    locks: ChannelLocks,
    mailboxes: ChannelMailboxes,
    dedup: RequestDeduplicator,
    sessions: SessionMap,
    stats: PerfTracker,
    backend: Arc<dyn CompletionBackend>,
    gate: Arc<dyn BackendGate>,
    persistence: Arc<dyn SessionPersistence>,
    sender: Arc<dyn GatewaySender>,
}

/// What to do after one completion pass under the held lock.
///
/// Deliberately a plain enum rather than an error type: collaborator
/// failures and runtime task cancellation must propagate untouched, while
/// this signal is always consumed by the processing loop.
enum AfterCall {
    Done(DispatchOutcome),
    /// A cancel flag was observed after the call returned: the produced
    /// text is already persisted, and the merged backlog replaces it as
    /// the active request, still under the same lock.
    Reprocess(PendingEnvelope),
}

impl MessageDispatcher {
    /// Create a new dispatcher and spawn its maintenance tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, deps: DispatcherDeps) -> Self {
        let locks = ChannelLocks::new();
        locks
            .clone()
            .spawn_monitor_task(DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_IDLE_AGE, "admission");

        let mailboxes = ChannelMailboxes::new();
        mailboxes
            .clone()
            .spawn_cleanup_task(DEFAULT_CLEANUP_INTERVAL, "channel_mailboxes");

        let dedup = RequestDeduplicator::new();
        dedup
            .clone()
            .spawn_sweep_task(config.dedup_max_age(), config.dedup_max_age());

        let sessions = SessionMap::new(Arc::clone(&deps.persistence), locks.clone(), &config);
        let stats = PerfTracker::new(config.stat_sample_cap, config.stat_max_stages);

        Self {
            config,
            locks,
            mailboxes,
            dedup,
            sessions,
            stats,
            backend: deps.backend,
            gate: deps.gate,
            persistence: deps.persistence,
            sender: deps.sender,
        }
    }

    /// Latency statistics recorded so far.
    pub fn stats(&self) -> &PerfTracker {
        &self.stats
    }

    /// The session map, for embedders that expose session introspection.
    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    /// Admit and process one inbound message.
    ///
    /// Returns the outcome of the *first* admission round; messages that
    /// were queued during the final persistence window are reprocessed
    /// here as fresh admission rounds before returning.
    pub async fn handle_message(&self, message: InboundMessage) -> DispatchOutcome {
        let mut current = message;
        let mut first_outcome = None;
        loop {
            let (outcome, followup) = self.admit_and_process(current).await;
            let outcome = *first_outcome.get_or_insert(outcome);
            match followup {
                Some(envelope) => {
                    self.stats.record("queue_wait", envelope.enqueued_at.elapsed());
                    current = envelope.message;
                }
                None => return outcome,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Admission (protocol steps 1-4, 7-8)
    // ------------------------------------------------------------------------

    /// Run one full admission round. The second element is a message that
    /// was queued after the holder's last drain, i.e. during the final
    /// persistence step; the caller re-enters the protocol with it.
    async fn admit_and_process(
        &self,
        mut message: InboundMessage,
    ) -> (DispatchOutcome, Option<PendingEnvelope>) {
        let request_id = Ulid::new().to_string();
        truncate_payload(&mut message.text, self.config.max_payload_len);

        // Step 1: dedup gate. A duplicate is rejected before it can queue
        // or touch the lock.
        let fp = fingerprint(&message.channel_id, &message.sender.id, &message.text);
        if !self.dedup.try_insert(&fp) {
            debug!(
                request_id = %request_id,
                channel_id = %message.channel_id,
                "Duplicate request dropped"
            );
            return (DispatchOutcome::Duplicate, None);
        }
        // Removed on every exit path from here on, including cancellation.
        let _dedup = self.dedup.guard(fp);

        // Step 2: external gate (circuit breaker).
        if !self.gate.can_execute() {
            debug!(
                request_id = %request_id,
                channel_id = %message.channel_id,
                "Backend gate refused execution"
            );
            self.notify(&message.reply_target, DEGRADED_NOTICE).await;
            return (DispatchOutcome::Degraded, None);
        }

        // Step 3: channel busy — queue for merge and signal the holder.
        if self.locks.is_locked(&message.channel_id) {
            let channel_id = message.channel_id.clone();
            self.mailboxes.queue_message(&channel_id, message).await;
            self.mailboxes.signal_cancel(&channel_id);
            debug!(
                request_id = %request_id,
                channel_id = %channel_id,
                "Channel busy; message queued for merge"
            );
            return (DispatchOutcome::Queued, None);
        }

        // Step 4: bounded lock acquisition.
        let admission_started = Instant::now();
        if let Err(e) = self
            .locks
            .acquire(&message.channel_id, self.config.lock_timeout())
            .await
        {
            warn!(
                request_id = %request_id,
                channel_id = %message.channel_id,
                error = %e,
                "Admission lock acquisition timed out"
            );
            self.notify(&message.reply_target, BUSY_NOTICE).await;
            return (DispatchOutcome::Busy, None);
        }
        self.stats.record("admission", admission_started.elapsed());

        let channel_id = message.channel_id.clone();

        // Step 7 lives in this guard: the lock is released on every exit
        // from the processing scope, including an early drop of the whole
        // dispatch future.
        let outcome = {
            let _release = ReleaseOnDrop {
                locks: &self.locks,
                channel_id: &channel_id,
            };
            self.process_holding_lock(&request_id, message).await
        };

        // Step 8: a message queued during the final persistence step gets
        // a fresh admission round.
        let followup = self.mailboxes.drain_and_merge(&channel_id).await;
        (outcome, followup)
    }

    // ------------------------------------------------------------------------
    // Processing (protocol steps 5-6)
    // ------------------------------------------------------------------------

    /// Process a message and then keep draining the merged backlog for as
    /// long as cancel flags are observed, all under the already-held lock.
    async fn process_holding_lock(
        &self,
        request_id: &str,
        message: InboundMessage,
    ) -> DispatchOutcome {
        let channel_id = message.channel_id.clone();
        self.mailboxes.reset_cancel(&channel_id);

        let session = self.sessions.get_or_create(&channel_id).await;

        let mut current = message;
        loop {
            match self.process_one(request_id, &session, current).await {
                AfterCall::Done(outcome) => return outcome,
                AfterCall::Reprocess(envelope) => {
                    self.stats.record("queue_wait", envelope.enqueued_at.elapsed());
                    debug!(
                        request_id = %request_id,
                        channel_id = %channel_id,
                        "Reprocessing merged backlog under the held lock"
                    );
                    current = envelope.message;
                }
            }
        }
    }

    /// One completion pass: record the user message, run the backend,
    /// persist, then either deliver or hand back the merged backlog.
    async fn process_one(
        &self,
        request_id: &str,
        session: &Arc<Session>,
        message: InboundMessage,
    ) -> AfterCall {
        let channel_id = message.channel_id.clone();
        let reply_target = message.reply_target.clone();

        session.set_reply_target(&reply_target).await;
        self.sessions.touch(&channel_id);

        // Multi-party channels get sender attribution so the model can
        // tell speakers apart.
        let seen = session.note_sender(&message.sender.id).await;
        let text = if seen > 1 {
            format!("{}: {}", message.sender.label(), message.text)
        } else {
            message.text.clone()
        };
        let user_entry = Message::text(Role::User, text);
        session.append_history(user_entry.clone()).await;

        if !message.should_respond {
            // Recorded for context only; nothing to generate.
            if let Err(e) = self.persistence.save(&channel_id, &[user_entry]).await {
                warn!(
                    request_id = %request_id,
                    channel_id = %channel_id,
                    error = %e,
                    "History save failed for recorded message"
                );
            }
            return AfterCall::Done(DispatchOutcome::Recorded);
        }

        let _ = self.sender.send_typing(&reply_target).await;

        let request = CompletionRequest {
            channel_id: channel_id.clone(),
            messages: session.history().await,
            stream: session.streaming_enabled(),
        };

        let completion_started = Instant::now();
        let response = match self.backend.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    request_id = %request_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Completion failed"
                );
                self.notify(&reply_target, FAILURE_NOTICE).await;
                return AfterCall::Done(DispatchOutcome::Failed);
            }
        };
        self.stats.record("completion", completion_started.elapsed());

        // Persist what the call produced before anything else. A queued
        // arrival must never cost us the generated text.
        let assistant_entry = Message::text(Role::Assistant, response.text.clone());
        session.append_history(assistant_entry.clone()).await;
        let persistence_started = Instant::now();
        if let Err(e) = self
            .persistence
            .save(&channel_id, &[user_entry, assistant_entry])
            .await
        {
            // Best effort: completion still counts, eviction will reflush.
            warn!(
                request_id = %request_id,
                channel_id = %channel_id,
                error = %e,
                "History save failed"
            );
        }
        self.stats.record("persistence", persistence_started.elapsed());

        // Cooperative cancel: newer input arrived mid-flight. The produced
        // text is kept in history, but the merged backlog becomes the
        // request that actually gets answered.
        if self.mailboxes.is_cancelled(&channel_id) {
            self.mailboxes.reset_cancel(&channel_id);
            if let Some(envelope) = self.mailboxes.drain_and_merge(&channel_id).await {
                return AfterCall::Reprocess(envelope);
            }
            // Flag without an envelope: the backlog was already consumed.
            // Deliver normally.
        }

        let delivery_started = Instant::now();
        match self.sender.deliver(&reply_target, &response.text).await {
            Ok(message_id) => {
                self.stats.record("delivery", delivery_started.elapsed());
                debug!(
                    request_id = %request_id,
                    channel_id = %channel_id,
                    message_id = %message_id,
                    "Reply delivered"
                );
                AfterCall::Done(DispatchOutcome::Completed)
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Reply delivery failed"
                );
                self.notify(&reply_target, FAILURE_NOTICE).await;
                AfterCall::Done(DispatchOutcome::Failed)
            }
        }
    }

    /// Deliver a short user-facing notice, swallowing delivery errors.
    async fn notify(&self, target: &str, text: &str) {
        if let Err(e) = self.sender.deliver(target, text).await {
            debug!(target = %target, error = %e, "Failed to deliver notice");
        }
    }
}

/// Releases a channel's admission lock when dropped.
struct ReleaseOnDrop<'a> {
    locks: &'a ChannelLocks,
    channel_id: &'a str,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.locks.release(self.channel_id);
    }
}

/// Truncate an oversized payload at a char boundary, appending a visible
/// marker.
fn truncate_payload(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(TRUNCATION_MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_payloads_alone() {
        let mut text = "hello".to_string();
        truncate_payload(&mut text, 100);
        assert_eq!(text, "hello");
    }

    #[test]
    fn truncate_cuts_and_marks_long_payloads() {
        let mut text = "x".repeat(100);
        truncate_payload(&mut text, 10);
        assert_eq!(text, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut text = "é".repeat(10); // 2 bytes per char
        truncate_payload(&mut text, 5);
        assert_eq!(text, format!("{}{}", "é".repeat(2), TRUNCATION_MARKER));
    }
}
