//! Convenience re-exports for common `recap` types.
//!
//! ```ignore
//! use recap::prelude::*;
//! ```
//!
//! Pulls in the cache, its collaborator traits with their HTTP adapters,
//! configuration and the request/response types. Policy internals and the
//! retry helper stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    CompletionOptions, ContextRequest, ContextResponse, HistoryMessage, MessageRole, Turn,
};

// ── Cache ───────────────────────────────────────────────────────────
pub use crate::coordinator::{CacheStats, ContextCache};
pub use crate::store::{CacheEntry, CacheStore, InMemoryStore};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::completion::{ChatCompletionClient, CompletionFuture, Summarizer};
pub use crate::history::{FetchFuture, HttpMessageFetcher, MessageFetcher};

// ── Configuration and errors ────────────────────────────────────────
pub use crate::config::{RecapConfig, RefreshConfig, StoreConfig, TimeoutConfig};
pub use crate::error::{ConfigError, ContextError, FetchError, SummarizationError};
