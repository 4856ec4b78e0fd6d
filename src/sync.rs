//! Synchronization primitives for floodgate.
//!
//! One admission lock per channel id: different channels proceed fully in
//! parallel while processing within a channel is serialized. Acquisition is
//! bounded by a timeout and is safe against the classic hazard of racing a
//! blocking acquire against a timer, where the acquire can win *after* the
//! caller already gave up and the lock ends up held by nobody.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default interval between maintenance runs (1 hour).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default max idle age before an unused lock entry is dropped (2 hours).
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(7200);

/// Error returned when the admission lock could not be acquired in time.
///
/// The caller must not assume the lock is free elsewhere: the attempt keeps
/// running detached and releases itself if it ever succeeds.
#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for channel '{channel_id}'")]
pub struct AcquireTimeout {
    pub channel_id: String,
    pub waited: Duration,
}

// Attempt states for the acquire/timeout race. Exactly one of the two
// racers wins the CAS away from WAITING; the loser acts accordingly.
const WAITING: u8 = 0;
const ABANDONED: u8 = 1;
const ACQUIRED: u8 = 2;

/// A successfully acquired lock: the permit plus when it was taken.
struct HeldLock {
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

/// Internal storage: maps channel id to (one-permit semaphore, last access).
type LockStorage = DashMap<String, (Arc<Semaphore>, Instant)>;

/// Per-channel admission locks with timeout-bounded, deadlock-safe
/// acquisition and stale-holder diagnostics.
///
/// Thread-safe and cheap to clone. Lock entries are created lazily on
/// first contention and cleaned up once idle.
#[derive(Clone)]
pub struct ChannelLocks {
    locks: Arc<LockStorage>,
    holders: Arc<DashMap<String, HeldLock>>,
}

impl ChannelLocks {
    /// Create a new empty lock table.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            holders: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the lock for a channel, waiting at most `timeout`.
    ///
    /// The underlying acquire runs as a spawned task that is never
    /// force-killed. If the timeout elapses first, the attempt is marked
    /// abandoned; should it later win the permit anyway, it releases the
    /// permit on the spot. If the attempt wins the permit inside the
    /// timeout window, the caller observes success. The lock is never held
    /// by nobody and never double-released.
    pub async fn acquire(
        &self,
        channel_id: &str,
        timeout: Duration,
    ) -> Result<(), AcquireTimeout> {
        let started = Instant::now();
        let semaphore = self.semaphore(channel_id);
        let state = Arc::new(AtomicU8::new(WAITING));

        // If this future is dropped mid-wait (the caller itself was
        // cancelled), the attempt below must not install a lock nobody
        // will release. Disarmed before every normal return.
        let mut abandon = AbandonOnDrop {
            state: Arc::clone(&state),
            armed: true,
        };

        let attempt_state = Arc::clone(&state);
        let holders = Arc::clone(&self.holders);
        let key = channel_id.to_string();
        let mut attempt = tokio::spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                // The semaphore is never closed; nothing to do if it were.
                return;
            };
            if attempt_state
                .compare_exchange(WAITING, ACQUIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                holders.insert(
                    key,
                    HeldLock {
                        _permit: permit,
                        acquired_at: Instant::now(),
                    },
                );
            }
            // CAS lost: the caller already timed out. Dropping the permit
            // here releases the lock the moment the abandoned attempt won.
        });

        let result = tokio::select! {
            join = &mut attempt => {
                if join.is_ok() && state.load(Ordering::Acquire) == ACQUIRED {
                    Ok(())
                } else {
                    // Attempt task panicked or produced no permit.
                    Err(AcquireTimeout {
                        channel_id: channel_id.to_string(),
                        waited: started.elapsed(),
                    })
                }
            }
            _ = tokio::time::sleep(timeout) => {
                if state
                    .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    debug!(
                        channel_id = %channel_id,
                        waited = ?timeout,
                        "Lock acquisition abandoned after timeout"
                    );
                    Err(AcquireTimeout {
                        channel_id: channel_id.to_string(),
                        waited: started.elapsed(),
                    })
                } else {
                    // The attempt won the permit inside the timeout window.
                    // Wait for it to finish installing the holder entry.
                    let _ = (&mut attempt).await;
                    Ok(())
                }
            }
        };
        abandon.armed = false;
        result
    }

    /// Release a channel's lock.
    ///
    /// No-op when the lock is already free, tolerating double-release in
    /// cleanup paths.
    pub fn release(&self, channel_id: &str) {
        self.holders.remove(channel_id);
    }

    /// Whether a channel's lock is currently held.
    pub fn is_locked(&self, channel_id: &str) -> bool {
        self.holders.contains_key(channel_id)
    }

    /// When the current holder acquired the lock, if it is held.
    pub fn locked_since(&self, channel_id: &str) -> Option<Instant> {
        self.holders.get(channel_id).map(|held| held.acquired_at)
    }

    /// Channels whose lock has been held longer than `max_age`.
    ///
    /// A long-held lock usually means a completion call is wedged; callers
    /// use this for diagnostics, never to force a release.
    pub fn stale_holders(&self, max_age: Duration) -> Vec<(String, Duration)> {
        let now = Instant::now();
        self.holders
            .iter()
            .filter_map(|entry| {
                let held_for = now.duration_since(entry.value().acquired_at);
                (held_for > max_age).then(|| (entry.key().clone(), held_for))
            })
            .collect()
    }

    /// Remove idle lock entries that haven't been touched recently.
    ///
    /// Only removes entries where no one holds or waits on the semaphore
    /// (`strong_count == 1`) and the last access is older than `max_age`.
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale_keys: Vec<_> = self
            .locks
            .iter()
            .filter(|entry| {
                let (semaphore, last_access) = entry.value();
                Arc::strong_count(semaphore) == 1
                    && now.duration_since(*last_access) > max_age
                    && !self.holders.contains_key(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale_keys.len();
        for key in stale_keys {
            self.locks.remove(&key);
        }
        count
    }

    /// Spawn a background task that drops idle entries and warns about
    /// stale holders.
    pub fn spawn_monitor_task(self, interval: Duration, max_age: Duration, name: &'static str) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for (channel_id, held_for) in self.stale_holders(max_age) {
                    warn!(
                        channel_id = %channel_id,
                        held_for = ?held_for,
                        locks = name,
                        "Admission lock held unusually long"
                    );
                }
                let removed = self.cleanup_stale(max_age);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = self.locks.len(),
                        locks = name,
                        "Cleaned up idle lock entries"
                    );
                }
            }
        });
    }

    /// Number of lock entries currently known.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether there are no lock entries.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Get or create the semaphore for a channel, refreshing its
    /// last-access timestamp.
    fn semaphore(&self, channel_id: &str) -> Arc<Semaphore> {
        let now = Instant::now();
        self.locks
            .entry(channel_id.to_string())
            .and_modify(|(_, last_access)| *last_access = now)
            .or_insert_with(|| (Arc::new(Semaphore::new(1)), now))
            .0
            .clone()
    }
}

impl Default for ChannelLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks an in-flight acquire attempt as abandoned if the waiting future
/// is dropped before it resolves.
struct AbandonOnDrop {
    state: Arc<AtomicU8>,
    armed: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self
                .state
                .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire);
        }
    }
}
