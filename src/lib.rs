//! Floodgate — per-conversation admission, queueing, and concurrency
//! control in front of an expensive completion call.
//!
//! Many independent producers (chat messages on a channel) compete to
//! trigger inference for the same conversation. Floodgate guarantees at
//! most one in-flight completion per channel, merges messages that arrive
//! while one is in flight, deduplicates accidental re-submits, bounds
//! per-channel state with LRU eviction, and tracks per-stage latency.
//!
//! The expensive call itself, durable storage, and the chat platform are
//! collaborator traits ([`llm::CompletionBackend`],
//! [`store::SessionPersistence`], [`gateway::GatewaySender`]) implemented
//! by the embedder.

pub mod config;
pub mod dedup;
pub mod gateway;
pub mod llm;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod store;
pub mod sync;

pub use config::Config;
pub use gateway::{DispatchOutcome, DispatcherDeps, GatewaySender, MessageDispatcher};
pub use protocol::{Attachment, InboundMessage, Sender};
