//! Per-channel session state and the bounded session map.
//!
//! A session is everything needed to build the next completion for a
//! channel: its in-memory history, who has spoken, where replies go. The
//! map is bounded; once it tracks more channels than the configured limit,
//! the least-recently-used sessions are flushed and evicted.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::Message;
use crate::store::SessionPersistence;
use crate::sync::ChannelLocks;

// ============================================================================
// Session
// ============================================================================

/// Mutable per-channel state.
///
/// History and routing fields are only mutated by the task holding the
/// channel's admission lock. The last-accessed timestamp is a plain atomic
/// so eviction scans can read it concurrently with a holder's writes.
pub struct Session {
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    history: Mutex<Vec<Message>>,
    /// Milliseconds since the owning map's epoch.
    last_accessed_ms: AtomicU64,
    streaming_enabled: AtomicBool,
    seen_senders: Mutex<HashSet<String>>,
    reply_target: Mutex<Option<String>>,
}

impl Session {
    fn new(channel_id: &str, history: Vec<Message>, now_ms: u64, streaming: bool) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            created_at: Utc::now(),
            history: Mutex::new(history),
            last_accessed_ms: AtomicU64::new(now_ms),
            streaming_enabled: AtomicBool::new(streaming),
            seen_senders: Mutex::new(HashSet::new()),
            reply_target: Mutex::new(None),
        }
    }

    /// Append one entry to the in-memory history.
    pub async fn append_history(&self, message: Message) {
        self.history.lock().await.push(message);
    }

    /// Snapshot of the full history, oldest first.
    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Record that a sender has spoken on this channel.
    ///
    /// Returns the number of distinct senders seen so far; once it exceeds
    /// one, the dispatcher attributes messages by sender label.
    pub async fn note_sender(&self, sender_id: &str) -> usize {
        let mut seen = self.seen_senders.lock().await;
        seen.insert(sender_id.to_string());
        seen.len()
    }

    /// Update where replies for this channel currently go.
    pub async fn set_reply_target(&self, target: &str) {
        *self.reply_target.lock().await = Some(target.to_string());
    }

    /// The most recent reply target, if any message has set one.
    pub async fn reply_target(&self) -> Option<String> {
        self.reply_target.lock().await.clone()
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming_enabled.load(Ordering::Relaxed)
    }

    pub fn set_streaming(&self, enabled: bool) {
        self.streaming_enabled.store(enabled, Ordering::Relaxed);
    }

    fn last_accessed_ms(&self) -> u64 {
        self.last_accessed_ms.load(Ordering::Relaxed)
    }

    fn touch(&self, now_ms: u64) {
        self.last_accessed_ms.store(now_ms, Ordering::Relaxed);
    }
}

// ============================================================================
// SessionMap
// ============================================================================

/// Bounded map from channel id to session, with LRU eviction.
///
/// Thread-safe and cheap to clone. Eviction flushes history through the
/// persistence hook before removal and never evicts a channel whose
/// admission lock is held.
#[derive(Clone)]
pub struct SessionMap {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    persistence: Arc<dyn SessionPersistence>,
    locks: ChannelLocks,
    epoch: Instant,
    limit: usize,
    margin_pct: usize,
    streaming_default: bool,
}

impl SessionMap {
    /// Create a new session map.
    pub fn new(
        persistence: Arc<dyn SessionPersistence>,
        locks: ChannelLocks,
        config: &Config,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            persistence,
            locks,
            epoch: Instant::now(),
            limit: config.max_tracked_channels.max(1),
            margin_pct: config.eviction_margin_pct,
            streaming_default: config.streaming_enabled,
        }
    }

    /// Look up a session without touching it.
    pub fn get(&self, channel_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(channel_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Refresh a channel's last-accessed timestamp.
    pub fn touch(&self, channel_id: &str) {
        if let Some(session) = self.sessions.get(channel_id) {
            session.touch(self.now_ms());
        }
    }

    /// Get the session for a channel, creating it on first contact.
    ///
    /// New sessions are seeded from persisted history when any exists; a
    /// load failure starts the session empty rather than refusing the
    /// message. Creation may push the map over its limit, in which case
    /// excess sessions are evicted before returning.
    pub async fn get_or_create(&self, channel_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(channel_id) {
            session.touch(self.now_ms());
            return session;
        }

        let history = match self.persistence.load(channel_id).await {
            Ok(Some(history)) => history,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(
                    channel_id = %channel_id,
                    error = %e,
                    "Failed to load persisted history; starting empty"
                );
                Vec::new()
            }
        };

        let session = self
            .sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(Session::new(
                    channel_id,
                    history,
                    self.now_ms(),
                    self.streaming_default,
                ))
            })
            .value()
            .clone();

        if self.sessions.len() > self.limit {
            self.evict_excess().await;
        }

        session
    }

    /// Number of tracked channels.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Evict least-recently-used sessions until the map is back under its
    /// limit, with a margin so a map at capacity does not evict on every
    /// insert. Returns the number evicted.
    ///
    /// Channels whose admission lock is held are skipped even when they
    /// are the oldest: mid-processing state is never evicted. Each victim
    /// is flushed through the persistence hook first; flush failures are
    /// logged and do not keep stale state in memory.
    pub async fn evict_excess(&self) -> usize {
        let count = self.sessions.len();
        if count <= self.limit {
            return 0;
        }
        let batch = (count - self.limit + self.limit * self.margin_pct / 100).max(1);

        let mut candidates: Vec<(String, u64)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed_ms()))
            .collect();
        candidates.sort_by_key(|(_, last_accessed)| *last_accessed);

        let mut evicted = 0;
        for (channel_id, _) in candidates {
            if evicted == batch {
                break;
            }
            if self.locks.is_locked(&channel_id) {
                debug!(
                    channel_id = %channel_id,
                    "Skipping eviction of locked channel"
                );
                continue;
            }
            if let Err(e) = self.persistence.flush(&channel_id).await {
                warn!(
                    channel_id = %channel_id,
                    error = %e,
                    "History flush failed before eviction"
                );
            }
            self.sessions.remove(&channel_id);
            evicted += 1;
        }

        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.sessions.len(),
                "Evicted least-recently-used sessions"
            );
        }
        evicted
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
