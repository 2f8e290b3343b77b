//! Error taxonomy for provider calls and engine operations.
//!
//! Adapters never retry: every failure surfaces immediately as one of these
//! variants and retry policy stays with the caller.

use crate::provider::ProviderId;
use thiserror::Error;

/// Failure talking to one LLM backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} is not configured (missing credential)")]
    NotConfigured(ProviderId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds until the limit resets, when the backend says
        retry_after_secs: Option<u64>,
    },

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure of a controller-level operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Summarization failed or returned unusable content. The turn log is
    /// guaranteed untouched when this is returned.
    #[error("compaction failed: {0}")]
    Compaction(String),

    #[error("{0} is already in progress")]
    Busy(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown provider '{0}' (expected anthropic, openai, or gemini)")]
    UnknownProvider(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(format!("{err:#}"))
    }
}
