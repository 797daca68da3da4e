//! Print the rolling context for one conversation.
//!
//! Refresh policy, store bounds and timeouts come from the `RECAP_*`
//! environment variables; the flags below override the refresh threshold
//! and step. `RECAP_API_KEY`, when set, is sent to the completion service as
//! a bearer token. Set `RUST_LOG=recap=debug` to watch refresh decisions.
//!
//! # Examples
//!
//! ```sh
//! # One call against local services
//! recap --conversation 42 --model llama3.2:1b
//!
//! # Walk the refresh cycle: bootstrap, reuse, refresh
//! recap --conversation 42 --model llama3.2:1b --repeat 3
//!
//! # Remote history service, JSON output
//! recap --conversation 7 --history-url https://chat.example.com --json
//! ```

use std::process;
use std::sync::Arc;

use clap::Parser;
use recap::prelude::*;
use recap::retry::RetryConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Print the rolling context for one conversation.
#[derive(Parser)]
#[command(name = "recap", version)]
struct Cli {
    /// Conversation id to summarize
    #[arg(long, short = 'c')]
    conversation: i64,

    /// Summarization model
    #[arg(long, default_value = "llama3.2:1b")]
    model: String,

    // ── Services ───────────────────────────────────────────────
    /// Base URL of the conversation history service
    #[arg(long, env = "RECAP_HISTORY_URL", default_value = "http://localhost:8000")]
    history_url: String,

    /// Chat completions endpoint
    #[arg(
        long,
        env = "RECAP_COMPLETION_URL",
        default_value = recap::completion::DEFAULT_COMPLETION_URL
    )]
    completion_url: String,

    /// Retries for transient HTTP failures (per adapter call)
    #[arg(long, default_value_t = 2)]
    retries: u32,

    // ── Policy ─────────────────────────────────────────────────
    /// Refresh threshold (overrides RECAP_THRESHOLD)
    #[arg(long)]
    threshold: Option<usize>,

    /// Refresh step (overrides RECAP_STEP)
    #[arg(long)]
    step: Option<usize>,

    // ── Sampling ───────────────────────────────────────────────
    /// Sampling temperature for refreshes
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens in a generated summary
    #[arg(long)]
    max_tokens: Option<u32>,

    // ── Output ─────────────────────────────────────────────────
    /// Call get_context this many times in a row
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Print each response as JSON
    #[arg(long)]
    json: bool,
}

fn build_config(cli: &Cli) -> Result<RecapConfig, String> {
    let mut config = RecapConfig::from_env().map_err(|e| e.to_string())?;
    if cli.threshold.is_some() || cli.step.is_some() {
        config = config.with_refresh(RefreshConfig::new(
            cli.threshold.unwrap_or(config.refresh.threshold),
            cli.step.unwrap_or(config.refresh.step),
        ));
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_request(cli: &Cli) -> ContextRequest {
    let mut options = CompletionOptions::default();
    if let Some(t) = cli.temperature {
        options = options.with_temperature(t);
    }
    if let Some(n) = cli.max_tokens {
        options = options.with_max_tokens(n);
    }
    let request = ContextRequest::new(&cli.model);
    if options == CompletionOptions::default() {
        request
    } else {
        request.with_options(options)
    }
}

async fn run(cli: &Cli) -> Result<(), String> {
    let config = build_config(cli)?;
    let retry = RetryConfig::with_retries(cli.retries);

    let fetcher = HttpMessageFetcher::new(&cli.history_url, config.timeouts.fetch)
        .map_err(|e| e.to_string())?
        .with_retry(retry.clone());
    let api_key = std::env::var("RECAP_API_KEY").ok();
    let summarizer =
        ChatCompletionClient::new(&cli.completion_url, api_key, config.timeouts.completion)
            .map_err(|e| e.to_string())?
            .with_retry(retry.clone());

    // Adapters bound each attempt; the cache bounds the retried whole.
    let config = config.with_retry_budget(&retry);
    let cache = ContextCache::new(config, Arc::new(fetcher), Arc::new(summarizer))
        .map_err(|e| e.to_string())?;
    let request = build_request(cli);

    for call in 1..=cli.repeat {
        let reply = cache
            .get_context(cli.conversation, &request)
            .await
            .map_err(|e| format!("{} error: {e}", e.kind()))?;
        if cli.json {
            let line = serde_json::to_string(&reply).map_err(|e| e.to_string())?;
            println!("{line}");
        } else {
            if cli.repeat > 1 {
                println!("── call {call}/{} ──", cli.repeat);
            }
            for line in &reply.messages[..reply.messages.len().saturating_sub(1)] {
                println!("  {line}");
            }
            println!("\n{}\n", reply.context);
        }
    }

    let stats = cache.stats();
    tracing::info!(
        refreshes = stats.refreshes,
        reuses = stats.reuses,
        "done"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
