//! HTTP front end for the `recap` context cache.
//!
//! `recap-web` wraps a shared [`ContextCache`] in an axum router so request
//! handlers in other services can fetch a conversation's rolling context
//! over HTTP.
//!
//! # Quick start
//!
//! ```ignore
//! use recap_web::{WebConfig, spawn_web};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ContextCache::new(config, fetcher, summarizer)?);
//! let addr = spawn_web(cache, WebConfig::default()).await?;
//! println!("recap: http://{addr}");
//! ```
//!
//! # Routes
//!
//! | Method | Path | Result |
//! |--------|------|--------|
//! | `POST` | `/api/conversations/{id}/context` | `{messages, context}`, refreshing if due |
//! | `GET` | `/api/conversations/{id}/context` | stored entry or 404 |
//! | `DELETE` | `/api/conversations/{id}/context` | 204 |
//! | `GET` | `/api/stats` | cache counters |
//!
//! Failures answer with `{"error": "...", "kind": "fetch" | "summarization" | "invalid_window"}`.

mod api;
mod server;

pub use api::ErrorBody;
pub use server::build_router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use recap::coordinator::ContextCache;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3001`.
    pub bind_addr: SocketAddr,
    /// How often expired entries are purged. `None` disables the sweep;
    /// expired entries are then only dropped when read.
    pub purge_interval: Option<Duration>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            purge_interval: Some(Duration::from_secs(300)),
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(
    cache: Arc<ContextCache>,
    config: WebConfig,
) -> std::io::Result<SocketAddr> {
    if let Some(every) = config.purge_interval.filter(|d| !d.is_zero()) {
        server::spawn_purge_task(cache.clone(), every);
    }
    let router = server::build_router(cache);
    server::start_server(router, config.bind_addr).await
}
