//! Context cache server.
//!
//! Serves rolling conversation summaries over HTTP. Refresh policy, store
//! bounds and timeouts come from the `RECAP_*` environment variables;
//! `RECAP_API_KEY`, when set, is sent to the completion service.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p recap-web
//! cargo run -p recap-web -- --port 8080 --history-url http://chat.internal:8000
//! RUST_LOG=recap=debug,tower_http=debug cargo run -p recap-web
//! ```
//!
//! Then ask for a context:
//!
//! ```bash
//! curl -X POST localhost:3001/api/conversations/42/context \
//!   -H 'content-type: application/json' -d '{"model": "llama3.2:1b"}'
//! ```

use std::sync::Arc;

use clap::Parser;
use recap::completion::{ChatCompletionClient, DEFAULT_COMPLETION_URL};
use recap::config::RecapConfig;
use recap::coordinator::ContextCache;
use recap::history::HttpMessageFetcher;
use recap::retry::RetryConfig;
use recap_web::{WebConfig, spawn_web};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context cache server.
#[derive(Parser)]
#[command(about = "HTTP server for refresh-ahead conversation summaries")]
struct Args {
    /// Port for the HTTP server.
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Bind on all interfaces instead of localhost.
    #[arg(long)]
    public: bool,

    /// Base URL of the conversation history service.
    #[arg(long, env = "RECAP_HISTORY_URL", default_value = "http://localhost:8000")]
    history_url: String,

    /// Chat completions endpoint.
    #[arg(long, env = "RECAP_COMPLETION_URL", default_value = DEFAULT_COMPLETION_URL)]
    completion_url: String,

    /// Retries for transient HTTP failures.
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Seconds between sweeps of expired entries (0 disables).
    #[arg(long, default_value_t = 300)]
    purge_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // 1. Configuration; an invalid policy refuses to start.
    let config = RecapConfig::from_env().map_err(|e| e.to_string())?;
    let retry = RetryConfig::with_retries(args.retries);

    // 2. Collaborators.
    let fetcher = HttpMessageFetcher::new(&args.history_url, config.timeouts.fetch)
        .map_err(|e| e.to_string())?
        .with_retry(retry.clone());
    let api_key = std::env::var("RECAP_API_KEY").ok();
    let summarizer =
        ChatCompletionClient::new(&args.completion_url, api_key, config.timeouts.completion)
            .map_err(|e| e.to_string())?
            .with_retry(retry.clone());

    // 3. The cache itself.
    // Adapters bound each attempt; the cache bounds the retried whole.
    let config = config.with_retry_budget(&retry);
    let cache = ContextCache::new(config, Arc::new(fetcher), Arc::new(summarizer))
        .map_err(|e| e.to_string())?;

    // 4. Serve.
    let host = if args.public { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let web_config = WebConfig {
        bind_addr: (host, args.port).into(),
        purge_interval: Some(std::time::Duration::from_secs(args.purge_secs)),
    };
    let addr = spawn_web(Arc::new(cache), web_config)
        .await
        .map_err(|e| format!("failed to bind: {e}"))?;
    info!(
        history = %args.history_url,
        completion = %args.completion_url,
        "recap listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for shutdown signal: {e}"))?;
    info!("shutting down");
    Ok(())
}
