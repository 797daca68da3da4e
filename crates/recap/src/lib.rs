//! Refresh-ahead rolling summary cache for ongoing conversations.
//!
//! `recap` maintains a bounded natural-language summary ("context") per
//! conversation so a downstream assistant never has to re-read the full
//! message history. Each call to
//! [`ContextCache::get_context`](coordinator::ContextCache::get_context) either
//! reuses the cached summary or regenerates it by fetching a fresh window of
//! messages and asking a summarization model to merge them into the prior
//! context.
//!
//! # Getting started
//!
//! ```ignore
//! use recap::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let config = RecapConfig::from_env().map_err(|e| e.to_string())?;
//!     let fetcher = HttpMessageFetcher::new("http://localhost:8000", config.timeouts.fetch)
//!         .map_err(|e| e.to_string())?;
//!     let summarizer = ChatCompletionClient::new(
//!         "http://localhost:11434/v1/chat/completions",
//!         None,
//!         config.timeouts.completion,
//!     )
//!     .map_err(|e| e.to_string())?;
//!
//!     let cache = ContextCache::new(config, Arc::new(fetcher), Arc::new(summarizer))
//!         .map_err(|e| e.to_string())?;
//!
//!     let reply = cache
//!         .get_context(42, &ContextRequest::new("llama3.2:1b"))
//!         .await
//!         .map_err(|e| e.to_string())?;
//!     println!("{}", reply.context);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`coordinator`] | [`ContextCache`](coordinator::ContextCache) entry point with per-conversation single-flight |
//! | [`policy`] | refresh state machine (`NoCache` / `Fresh` / `Due`) |
//! | [`merge`] | summarizer prompt construction |
//! | [`store`] | [`CacheStore`](store::CacheStore) trait and the bounded [`InMemoryStore`](store::InMemoryStore) |
//! | [`history`] | [`MessageFetcher`](history::MessageFetcher) trait and HTTP adapter |
//! | [`completion`] | [`Summarizer`](completion::Summarizer) trait and chat-completions adapter |
//! | [`retry`] | backoff for the adapters |
//! | [`config`] | thresholds, bounds, timeouts, environment loading |
//! | [`error`] | typed failures |

pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod merge;
pub mod policy;
pub mod prelude;
pub mod retry;
pub mod store;

use serde::{Deserialize, Serialize};

// ── Message types ──────────────────────────────────────────────────

/// Role of a turn sent to the summarizer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged prompt turn for the completion service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: MessageRole,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A stored chat message as returned by the history service.
///
/// The role is free-form text; the history service accepts any role name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

// ── Request / response types ───────────────────────────────────────

/// Sampling options forwarded to the completion service. Unset fields are
/// omitted from the request body.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CompletionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl CompletionOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Parameters of one `get_context` call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextRequest {
    /// Model used if this call refreshes the summary.
    pub model: String,
    /// Refresh threshold for this call. `None` uses the configured threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<CompletionOptions>,
}

impl ContextRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            window_count: None,
            options: None,
        }
    }

    pub fn with_window_count(mut self, window_count: usize) -> Self {
        self.window_count = Some(window_count);
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Result of one `get_context` call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContextResponse {
    /// The fetched window as `role: content` lines, followed by the context
    /// as the final element.
    pub messages: Vec<String>,
    /// The current rolling summary.
    pub context: String,
}
