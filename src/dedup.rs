//! In-flight request deduplication.
//!
//! Chat transports redeliver: a webhook retry or a reconnecting client can
//! hand us the same message twice within a few hundred milliseconds. The
//! deduplicator rejects a second admission attempt with an identical
//! fingerprint while the first is still pending, before it can queue or
//! touch the channel lock.
//!
//! Entries are removed by the [`DedupGuard`] on every exit path from a
//! dispatch; the periodic sweep is a backstop, not the primary mechanism.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// Number of payload characters that participate in the fingerprint.
const FINGERPRINT_PAYLOAD_CHARS: usize = 50;

/// Compute the stable fingerprint for an inbound message.
///
/// Hashes the channel id, the sender id, and the head of the payload.
/// Only the first [`FINGERPRINT_PAYLOAD_CHARS`] characters participate, so
/// a transport that re-chunks long messages still fingerprints identically.
pub fn fingerprint(channel_id: &str, sender_id: &str, payload: &str) -> String {
    let head: String = payload.chars().take(FINGERPRINT_PAYLOAD_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(sender_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(head.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bounded table of in-flight request fingerprints.
///
/// Thread-safe and cheap to clone. Purely in-memory; no error paths.
#[derive(Clone, Default)]
pub struct RequestDeduplicator {
    inflight: Arc<DashMap<String, Instant>>,
}

impl RequestDeduplicator {
    /// Create an empty deduplicator.
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Atomically record a fingerprint unless it is already in flight.
    ///
    /// Returns `false` (and records nothing) when a duplicate is pending.
    pub fn try_insert(&self, fp: &str) -> bool {
        let mut duplicate = false;
        self.inflight
            .entry(fp.to_string())
            .and_modify(|_| duplicate = true)
            .or_insert_with(Instant::now);
        !duplicate
    }

    /// Whether a fingerprint is currently in flight.
    pub fn is_duplicate(&self, fp: &str) -> bool {
        self.inflight.contains_key(fp)
    }

    /// Remove a fingerprint. No-op when absent.
    pub fn remove(&self, fp: &str) {
        self.inflight.remove(fp);
    }

    /// Wrap a recorded fingerprint in a guard that removes it on drop.
    ///
    /// This is how the dispatcher guarantees removal on every exit path,
    /// including early returns and future cancellation.
    pub fn guard(&self, fp: String) -> DedupGuard {
        DedupGuard {
            dedup: self.clone(),
            fingerprint: fp,
        }
    }

    /// Remove entries older than `max_age`. Returns the number removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.inflight.len();
        self.inflight
            .retain(|_, inserted| now.duration_since(*inserted) <= max_age);
        before.saturating_sub(self.inflight.len())
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether no fingerprints are tracked.
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Spawn a background task that periodically sweeps stale entries.
    ///
    /// A fingerprint should only outlive its dispatch if the guard was
    /// leaked across a process-level fault, so any sweep hit is logged.
    pub fn spawn_sweep_task(self, interval: Duration, max_age: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep(max_age);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.len(),
                        "Swept stale dedup fingerprints"
                    );
                }
            }
        });
    }
}

/// Removes its fingerprint from the deduplicator when dropped.
pub struct DedupGuard {
    dedup: RequestDeduplicator,
    fingerprint: String,
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        self.dedup.remove(&self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // fingerprint
    // ------------------------------------------------------------------------

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint("chan", "user", "hello world");
        let b = fingerprint("chan", "user", "hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_channel_and_sender() {
        let base = fingerprint("chan", "user", "hello");
        assert_ne!(base, fingerprint("other", "user", "hello"));
        assert_ne!(base, fingerprint("chan", "other", "hello"));
    }

    #[test]
    fn fingerprint_ignores_payload_tail() {
        let head: String = "x".repeat(FINGERPRINT_PAYLOAD_CHARS);
        let a = fingerprint("chan", "user", &format!("{head}AAAA"));
        let b = fingerprint("chan", "user", &format!("{head}BBBB"));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_handles_multibyte_payloads() {
        // Must not panic on non-ASCII boundaries near the cutoff.
        let payload = "é".repeat(FINGERPRINT_PAYLOAD_CHARS + 10);
        let _ = fingerprint("chan", "user", &payload);
    }

    // ------------------------------------------------------------------------
    // try_insert / remove
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn second_insert_is_rejected_while_pending() {
        let dedup = RequestDeduplicator::new();
        assert!(dedup.try_insert("fp1"));
        assert!(!dedup.try_insert("fp1"));
        assert!(dedup.is_duplicate("fp1"));
    }

    #[tokio::test]
    async fn insert_succeeds_again_after_removal() {
        let dedup = RequestDeduplicator::new();
        assert!(dedup.try_insert("fp1"));
        dedup.remove("fp1");
        assert!(dedup.try_insert("fp1"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dedup = RequestDeduplicator::new();
        dedup.try_insert("fp1");
        dedup.remove("fp1");
        dedup.remove("fp1");
        assert!(dedup.is_empty());
    }

    // ------------------------------------------------------------------------
    // guard
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn guard_removes_on_drop() {
        let dedup = RequestDeduplicator::new();
        dedup.try_insert("fp1");
        {
            let _guard = dedup.guard("fp1".to_string());
            assert!(dedup.is_duplicate("fp1"));
        }
        assert!(!dedup.is_duplicate("fp1"));
    }

    #[tokio::test]
    async fn guard_removes_on_early_return() {
        let dedup = RequestDeduplicator::new();

        fn admit(dedup: &RequestDeduplicator) -> bool {
            if !dedup.try_insert("fp1") {
                return false;
            }
            let _guard = dedup.guard("fp1".to_string());
            // Early return path: guard still cleans up.
            false
        }

        admit(&dedup);
        assert!(dedup.is_empty());
    }

    // ------------------------------------------------------------------------
    // sweep
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_stale_entries() {
        let dedup = RequestDeduplicator::new();
        dedup.try_insert("old");
        tokio::time::advance(Duration::from_secs(600)).await;
        dedup.try_insert("fresh");

        let removed = dedup.sweep(Duration::from_secs(300));
        assert_eq!(removed, 1);
        assert!(!dedup.is_duplicate("old"));
        assert!(dedup.is_duplicate("fresh"));
    }
}
