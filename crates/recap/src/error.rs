//! Error types for the context cache and its collaborators.
//!
//! The two collaborator failures are kept apart so callers can tell
//! "history unavailable" from "summarizer unavailable". Neither is retried by
//! the cache itself; the HTTP adapters consult [`FetchError::is_transient`] and
//! [`SummarizationError::is_transient`] when a [`RetryConfig`](crate::retry::RetryConfig)
//! allows it.

use std::time::Duration;

use thiserror::Error;

/// The message history service could not produce a window.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("history request failed: {0}")]
    Transport(String),

    #[error("history service HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode history response: {0}")]
    Decode(String),

    #[error("invalid window size {0}: must be positive")]
    InvalidWindow(usize),

    #[error("history request timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Whether a retry of the identical request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => is_transient_status(*status),
            FetchError::Decode(_) | FetchError::InvalidWindow(_) => false,
        }
    }
}

/// The completion service could not produce a usable summary.
#[derive(Debug, Error)]
pub enum SummarizationError {
    #[error("completion request failed: {0}")]
    Transport(String),

    #[error("completion service HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion API error: {0}")]
    Api(String),

    #[error("failed to decode completion response: {0}")]
    Decode(String),

    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion returned an empty summary")]
    EmptyResult,
}

impl SummarizationError {
    /// Whether a retry of the identical request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SummarizationError::Transport(_) | SummarizationError::Timeout(_) => true,
            SummarizationError::Status { status, .. } => is_transient_status(*status),
            SummarizationError::Api(_)
            | SummarizationError::Decode(_)
            | SummarizationError::EmptyResult => false,
        }
    }
}

/// Invalid thresholds or settings, detected before any request is served.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("refresh threshold must be greater than zero")]
    ZeroThreshold,

    #[error("refresh step must be greater than zero")]
    ZeroStep,

    #[error("refresh step {step} exceeds threshold {threshold}")]
    StepExceedsThreshold { step: usize, threshold: usize },

    #[error("store capacity must be greater than zero")]
    ZeroCapacity,

    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Error returned by [`ContextCache::get_context`](crate::coordinator::ContextCache::get_context).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Summarization(#[from] SummarizationError),

    #[error("invalid window count {window}: must be at least the refresh step {step}")]
    InvalidWindow { window: usize, step: usize },
}

impl ContextError {
    /// Short machine-readable label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextError::Fetch(_) => "fetch",
            ContextError::Summarization(_) => "summarization",
            ContextError::InvalidWindow { .. } => "invalid_window",
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
