//! Completion backend error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a completion backend.
///
/// The dispatcher logs the detail and shows the end user only a short,
/// generic failure notice.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The backend is temporarily unavailable (provider outage, rate limit).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The completion did not finish within the caller-supplied bound.
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    /// The backend returned a response that could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
