//! Message history collaborator: fetches the last `n` messages of a conversation.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::HistoryMessage;
use crate::error::FetchError;
use crate::retry::{RetryConfig, with_retry};

/// Default path template on the history service. `{id}` is replaced with
/// the conversation id.
pub const DEFAULT_HISTORY_PATH: &str = "/api/chat/public/conversations/{id}/messages/";

/// Future returned by [`MessageFetcher::fetch_last_n`].
pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<HistoryMessage>, FetchError>> + Send + 'a>>;

/// Source of recent conversation messages.
///
/// Implementations return at most `n` of the most recent messages, oldest
/// first, and fail with [`FetchError::InvalidWindow`] when `n` is zero.
pub trait MessageFetcher: Send + Sync {
    fn fetch_last_n(&self, conversation_id: i64, n: usize) -> FetchFuture<'_>;
}

/// Fetches windows from the conversation service over HTTP.
///
/// Issues `GET {base_url}{path}?n={n}` and expects a JSON array of objects
/// with at least `role` and `content` fields.
pub struct HttpMessageFetcher {
    client: reqwest::Client,
    base_url: String,
    path: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpMessageFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("recap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            path: DEFAULT_HISTORY_PATH.to_string(),
            timeout,
            retry: RetryConfig::default(),
        })
    }

    /// Override the path template (must contain `{id}`).
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// URL for one window request.
    pub fn url_for(&self, conversation_id: i64, n: usize) -> String {
        let path = self.path.replace("{id}", &conversation_id.to_string());
        format!("{}{path}?n={n}", self.base_url)
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<HistoryMessage>, FetchError> {
        let start = Instant::now();
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to read response: {e}")))?;

        debug!(
            "history response: HTTP {} in {:.2}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

impl MessageFetcher for HttpMessageFetcher {
    fn fetch_last_n(&self, conversation_id: i64, n: usize) -> FetchFuture<'_> {
        Box::pin(async move {
            if n == 0 {
                return Err(FetchError::InvalidWindow(n));
            }
            let url = self.url_for(conversation_id, n);
            debug!(conversation_id, n, "fetching history window");
            let url = url.as_str();
            let mut messages = with_retry(&self.retry, "history fetch", move || async move {
                tokio::time::timeout(self.timeout, self.fetch_once(url))
                    .await
                    .unwrap_or(Err(FetchError::Timeout(self.timeout)))
            })
            .await?;
            let received = messages.len();
            keep_last(&mut messages, n);
            debug!(
                conversation_id,
                requested = n,
                received,
                kept = messages.len(),
                "history window fetched"
            );
            Ok(messages)
        })
    }
}

/// Trim `messages` to its newest `n` entries, keeping chronological order.
fn keep_last(messages: &mut Vec<HistoryMessage>, n: usize) {
    if messages.len() > n {
        let extra = messages.len() - n;
        messages.drain(..extra);
    }
}
