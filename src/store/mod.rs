//! Session persistence trait.
//!
//! Durable storage of conversation history is outside this crate; the
//! session map only needs to seed new sessions, append what a processing
//! pass produced, and flush before eviction.

mod error;

pub use error::{StorageError, StorageResult};

use async_trait::async_trait;

use crate::llm::Message;

/// Storage interface for conversation history.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Load previously persisted history for a channel.
    ///
    /// Returns `Ok(None)` when the channel has never been seen.
    async fn load(&self, channel_id: &str) -> StorageResult<Option<Vec<Message>>>;

    /// Append newly produced entries to the channel's durable history.
    async fn save(&self, channel_id: &str, entries: &[Message]) -> StorageResult<()>;

    /// Flush any buffered state for the channel.
    ///
    /// Called before the channel's in-memory session is evicted. Failures
    /// are logged by the caller and do not block eviction.
    async fn flush(&self, channel_id: &str) -> StorageResult<()>;
}
