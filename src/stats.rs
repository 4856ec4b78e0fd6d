//! Per-stage latency tracking.
//!
//! Bounded in both dimensions: each stage keeps a fixed-size ring of recent
//! samples, and the set of stage names itself is capped so a typo'd stage
//! name can never grow memory without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

/// Aggregate statistics for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    /// Number of retained samples (at most the sample cap).
    pub count: usize,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
}

/// Bounded latency sample collection, keyed by stage name.
///
/// Shared across all channels; thread-safe and cheap to clone. Recording
/// is purely additive and never fails — at worst a sample is dropped with
/// a warning when the stage-name cap is hit.
#[derive(Clone)]
pub struct PerfTracker {
    stages: Arc<DashMap<String, Mutex<VecDeque<Duration>>>>,
    sample_cap: usize,
    max_stages: usize,
}

impl PerfTracker {
    /// Create a tracker retaining at most `sample_cap` samples for each of
    /// at most `max_stages` distinct stage names.
    pub fn new(sample_cap: usize, max_stages: usize) -> Self {
        Self {
            stages: Arc::new(DashMap::new()),
            sample_cap: sample_cap.max(1),
            max_stages: max_stages.max(1),
        }
    }

    /// Record one timing observation for a named stage.
    ///
    /// The oldest sample is dropped once the stage is at the sample cap.
    /// A stage name beyond the stage cap is rejected with a warning.
    pub fn record(&self, stage: &str, duration: Duration) {
        if let Some(samples) = self.stages.get(stage) {
            push_bounded(&samples, duration, self.sample_cap);
            return;
        }

        if self.stages.len() >= self.max_stages {
            warn!(
                stage = stage,
                cap = self.max_stages,
                "Stage cap reached; sample dropped"
            );
            return;
        }

        let samples = self
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.sample_cap.min(64))));
        push_bounded(&samples, duration, self.sample_cap);
    }

    /// Statistics over the retained samples for one stage.
    ///
    /// Returns `None` for an unknown stage or one with no samples.
    pub fn stats(&self, stage: &str) -> Option<StageStats> {
        let samples = self.stages.get(stage)?;
        let samples = match samples.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        summarize(&samples)
    }

    /// Statistics for every tracked stage, sorted by stage name.
    pub fn stats_all(&self) -> Vec<(String, StageStats)> {
        let mut all: Vec<(String, StageStats)> = self
            .stages
            .iter()
            .filter_map(|entry| {
                let samples = match entry.value().lock() {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                summarize(&samples).map(|stats| (entry.key().clone(), stats))
            })
            .collect();
        all.sort_by(|(a, _), (b, _)| a.cmp(b));
        all
    }

    /// Drop all samples for one stage, freeing its slot in the stage set.
    pub fn clear(&self, stage: &str) {
        self.stages.remove(stage);
    }

    /// Drop all samples for all stages.
    pub fn clear_all(&self) {
        self.stages.clear();
    }

    /// Number of distinct stages currently tracked.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

fn push_bounded(samples: &Mutex<VecDeque<Duration>>, duration: Duration, cap: usize) {
    let mut samples = match samples.lock() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    if samples.len() == cap {
        samples.pop_front();
    }
    samples.push_back(duration);
}

fn summarize(samples: &VecDeque<Duration>) -> Option<StageStats> {
    if samples.is_empty() {
        return None;
    }
    let mut min = Duration::MAX;
    let mut max = Duration::ZERO;
    let mut total = Duration::ZERO;
    for &sample in samples {
        min = min.min(sample);
        max = max.max(sample);
        total += sample;
    }
    Some(StageStats {
        count: samples.len(),
        avg: total / samples.len() as u32,
        min,
        max,
    })
}
