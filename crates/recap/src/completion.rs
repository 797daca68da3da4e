//! Completion collaborator: one chat completion per refresh.
//!
//! [`ChatCompletionClient`] speaks the OpenAI-compatible `chat/completions`
//! wire format, which covers OpenRouter, Ollama's `/v1` endpoint, vLLM and
//! llama.cpp servers alike.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::SummarizationError;
use crate::retry::{RetryConfig, with_retry};
use crate::{CompletionOptions, Turn};

/// Ollama's OpenAI-compatible endpoint on its default port.
pub const DEFAULT_COMPLETION_URL: &str = "http://localhost:11434/v1/chat/completions";

/// Future returned by [`Summarizer::complete`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, SummarizationError>> + Send + 'a>>;

/// Generates text from a sequence of role-tagged turns.
///
/// Returns the raw generated text. Callers decide what counts as unusable
/// output; the context cache rejects empty text.
pub trait Summarizer: Send + Sync {
    fn complete<'a>(
        &'a self,
        turns: &'a [Turn],
        model: &'a str,
        options: Option<&'a CompletionOptions>,
    ) -> CompletionFuture<'a>;
}

// ── Wire types ─────────────────────────────────────────────────────

/// Chat completion request body.
#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
    #[serde(flatten)]
    options: Option<&'a CompletionOptions>,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct ChatCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
}

impl ChatCompletionClient {
    /// Create a client for `endpoint`. `api_key` is sent as a bearer token
    /// when present.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SummarizationError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("recap/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SummarizationError::Transport(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            timeout,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn complete_once(&self, body: &ChatRequest<'_>) -> Result<String, SummarizationError> {
        trace!(
            "completion payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SummarizationError::Timeout(self.timeout)
            } else {
                SummarizationError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            SummarizationError::Transport(format!("failed to read response: {e}"))
        })?;

        debug!(
            "completion response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(SummarizationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| SummarizationError::Decode(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(SummarizationError::Api(err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| SummarizationError::Api("response contained no choices".into()))?;

        debug!(
            finish_reason = choice.finish_reason.as_deref().unwrap_or("(none)"),
            chars = choice.message.content.as_ref().map_or(0, |s| s.len()),
            "completion output"
        );

        Ok(choice.message.content.unwrap_or_default())
    }
}

impl Summarizer for ChatCompletionClient {
    fn complete<'a>(
        &'a self,
        turns: &'a [Turn],
        model: &'a str,
        options: Option<&'a CompletionOptions>,
    ) -> CompletionFuture<'a> {
        Box::pin(async move {
            debug!(model, turns = turns.len(), "completion request");
            let body = ChatRequest {
                model,
                messages: turns,
                stream: false,
                options,
            };
            let body = &body;
            with_retry(&self.retry, "completion", move || async move {
                tokio::time::timeout(self.timeout, self.complete_once(body))
                    .await
                    .unwrap_or(Err(SummarizationError::Timeout(self.timeout)))
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_flattens_options() {
        let turns = vec![Turn::system("rules"), Turn::user("CHAT:\nuser: hi")];
        let options = CompletionOptions::default().with_temperature(0.0);
        let body = ChatRequest {
            model: "llama3.2:1b",
            messages: &turns,
            stream: false,
            options: Some(&options),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3.2:1b");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "CHAT:\nuser: hi");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["stream"], false);
        assert!(json.get("options").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn request_without_options_has_no_sampling_fields() {
        let turns = vec![Turn::user("x")];
        let body = ChatRequest {
            model: "m",
            messages: &turns,
            stream: false,
            options: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn empty_api_key_is_dropped() {
        let client =
            ChatCompletionClient::new(DEFAULT_COMPLETION_URL, Some(String::new()), Duration::from_secs(1))
                .unwrap();
        assert!(client.api_key.is_none());
    }
}
