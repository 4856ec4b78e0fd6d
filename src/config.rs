//! Runtime configuration.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

// ============================================================================
// Config
// ============================================================================

/// Tunables for the admission layer.
///
/// Every field has a default, so an empty (or absent) config file yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upper bound on waiting for a channel's admission lock, in seconds.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Number of tracked channels above which LRU eviction kicks in.
    #[serde(default = "default_max_tracked_channels")]
    pub max_tracked_channels: usize,
    /// Extra headroom trimmed on eviction, as a percentage of the limit,
    /// so a store sitting at capacity does not evict on every insert.
    #[serde(default = "default_eviction_margin_pct")]
    pub eviction_margin_pct: usize,
    /// Age after which an in-flight dedup fingerprint is swept, in seconds.
    #[serde(default = "default_dedup_max_age_secs")]
    pub dedup_max_age_secs: u64,
    /// Maximum latency samples retained per stage.
    #[serde(default = "default_stat_sample_cap")]
    pub stat_sample_cap: usize,
    /// Maximum number of distinct stage names tracked.
    #[serde(default = "default_stat_max_stages")]
    pub stat_max_stages: usize,
    /// Maximum inbound payload length in bytes; longer payloads are
    /// truncated with a visible marker before admission.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    /// Whether completion requests ask the backend to stream.
    #[serde(default)]
    pub streaming_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            max_tracked_channels: default_max_tracked_channels(),
            eviction_margin_pct: default_eviction_margin_pct(),
            dedup_max_age_secs: default_dedup_max_age_secs(),
            stat_sample_cap: default_stat_sample_cap(),
            stat_max_stages: default_stat_max_stages(),
            max_payload_len: default_max_payload_len(),
            streaming_enabled: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error: defaults apply.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(toml::from_str(&contents)?)
    }

    /// Lock-acquire timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Dedup entry max age as a [`Duration`].
    pub fn dedup_max_age(&self) -> Duration {
        Duration::from_secs(self.dedup_max_age_secs)
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_max_tracked_channels() -> usize {
    256
}

fn default_eviction_margin_pct() -> usize {
    10
}

fn default_dedup_max_age_secs() -> u64 {
    300
}

fn default_stat_sample_cap() -> usize {
    500
}

fn default_stat_max_stages() -> usize {
    32
}

fn default_max_payload_len() -> usize {
    4000
}
