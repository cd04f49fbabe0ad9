//! Text-generation oracle abstraction and the summarization adapter.
//!
//! The [`Oracle`] trait is the request/response boundary to an external
//! text-generation service. [`OracleAdapter`] wraps any oracle with what the
//! pipeline needs on top of it:
//!
//! - bounded concurrency (a semaphore sized by `oracle.workers`),
//! - exponential backoff on [`OracleError::RateLimited`],
//! - the `summarize` / `detect_tool_usage` prompts,
//! - a call counter used by the run report.
//!
//! # Retry Strategy
//!
//! - `RateLimited` → retry after `base × 2^(attempt-1)` (exponent capped at 5),
//!   at most `max_retries` times, then surface the error.
//! - `Unavailable` → fail immediately (fatal for the run).
//! - `BudgetExceeded` → fail immediately; the caller must re-chunk.
//!
//! # Providers
//!
//! | Config Value | Oracle |
//! |-------------|--------|
//! | `"openai"` | [`OpenAIOracle`] (any OpenAI-compatible chat completions endpoint) |
//! | `"disabled"` | [`DisabledOracle`] |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::chunk::estimate_tokens;
use crate::config::OracleConfig;

/// Typed failures at the oracle boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// Network, auth or server failure. Fatal for the current run.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// Throttled by the provider. Retryable with backoff.
    #[error("oracle rate limited: {0}")]
    RateLimited(String),
    /// The input is larger than the provider accepts. Re-chunk, don't retry.
    #[error("oracle input budget exceeded: ~{estimated} tokens > limit {limit}")]
    BudgetExceeded { estimated: usize, limit: usize },
}

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    /// System role text.
    pub instructions: String,
    /// User content.
    pub content: String,
    pub max_output_tokens: usize,
    pub temperature: f32,
}

impl OracleRequest {
    pub fn estimated_input_tokens(&self) -> usize {
        estimate_tokens(&self.instructions) + estimate_tokens(&self.content)
    }
}

/// An external text-generation capability.
///
/// Implementations are not expected to be deterministic: with a non-zero
/// temperature the same request may produce different text.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Short backend identifier for logs (e.g. the model name).
    fn name(&self) -> &str;

    /// Produce a completion for `request`.
    async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

// ============ Disabled Oracle ============

/// An oracle that always fails with [`OracleError::Unavailable`].
///
/// Used when `oracle.provider = "disabled"`; commands that never call the
/// oracle (`check`, `tools`) still work.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &OracleRequest) -> Result<String, OracleError> {
        Err(OracleError::Unavailable(
            "oracle provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI Oracle ============

/// Oracle backed by an OpenAI-compatible `POST {url}/chat/completions`.
///
/// Requires the `OPENAI_API_KEY` environment variable. Status codes map to
/// [`OracleError`] as follows: 429 → `RateLimited`; 400 mentioning the
/// context length → `BudgetExceeded`; any other failure → `Unavailable`.
pub struct OpenAIOracle {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_input_tokens: usize,
}

impl OpenAIOracle {
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment or the
    /// HTTP client cannot be built.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_input_tokens: config.max_input_tokens,
        })
    }
}

#[async_trait]
impl Oracle for OpenAIOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let estimated = request.estimated_input_tokens();
        if estimated > self.max_input_tokens {
            return Err(OracleError::BudgetExceeded {
                estimated,
                limit: self.max_input_tokens,
            });
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": request.content },
            ],
            "max_tokens": request.max_output_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| OracleError::Unavailable(format!("invalid response body: {}", e)))?;
            return parse_chat_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        Err(classify_failure(status.as_u16(), &body_text, estimated, self.max_input_tokens))
    }
}

/// Map a non-success HTTP status to an [`OracleError`].
fn classify_failure(status: u16, body: &str, estimated: usize, limit: usize) -> OracleError {
    match status {
        429 => OracleError::RateLimited(format!("HTTP 429: {}", body)),
        400 | 413
            if body.contains("context_length_exceeded")
                || body.contains("maximum context length") =>
        {
            OracleError::BudgetExceeded { estimated, limit }
        }
        _ => OracleError::Unavailable(format!("HTTP {}: {}", status, body)),
    }
}

/// Extract `choices[0].message.content` and log token usage.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, OracleError> {
    if let Some(usage) = json.get("usage") {
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        tracing::debug!(prompt, completion, total = prompt + completion, "oracle usage");
    }

    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| {
            OracleError::Unavailable("invalid response: missing choices[0].message.content".into())
        })
}

/// Create the oracle named by `config.provider`.
///
/// # Errors
///
/// Returns an error for unknown providers or if the provider cannot be
/// initialized (e.g. missing API key).
pub fn create_oracle(config: &OracleConfig) -> Result<Arc<dyn Oracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledOracle)),
        "openai" => Ok(Arc::new(OpenAIOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

// ============ Adapter ============

/// Backoff settings for rate-limited calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OracleConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Summarization front-end over an [`Oracle`].
pub struct OracleAdapter {
    oracle: Arc<dyn Oracle>,
    retry: RetryPolicy,
    permits: Semaphore,
    calls: AtomicUsize,
}

impl OracleAdapter {
    pub fn new(oracle: Arc<dyn Oracle>, retry: RetryPolicy, workers: usize) -> Self {
        Self {
            oracle,
            retry,
            permits: Semaphore::new(workers.max(1)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of requests sent to the oracle so far, retries included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Summarize `text` following `instructions`.
    pub async fn summarize(
        &self,
        text: &str,
        instructions: &str,
        max_output_tokens: usize,
        temperature: f32,
    ) -> Result<String, OracleError> {
        let request = OracleRequest {
            instructions: instructions.to_string(),
            content: text.to_string(),
            max_output_tokens,
            temperature,
        };
        self.complete_with_retry(&request).await
    }

    /// Short installation instructions for an unrecognised tool signature.
    pub async fn detect_tool_usage(
        &self,
        signature: &str,
        temperature: f32,
    ) -> Result<String, OracleError> {
        let instructions = "You are a helpful assistant that identifies build and \
            infrastructure tools from file names and gives brief, step-by-step \
            installation instructions for Windows, Mac, and Ubuntu.";
        let content = format!(
            "A repository contains files matching '{}'. Name the tool they belong to \
             and give concise instructions on how to install it on Windows, Mac, \
             and Ubuntu. Keep it short and clear.",
            signature
        );
        self.summarize(&content, instructions, 300, temperature).await
    }

    async fn complete_with_retry(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| OracleError::Unavailable(e.to_string()))?;
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.oracle.complete(request).await
            };

            match result {
                Err(OracleError::RateLimited(msg)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        oracle = self.oracle.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off: {}",
                        msg
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed list of results, then echoes the request content.
    struct Scripted {
        script: Mutex<Vec<Result<String, OracleError>>>,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<String, OracleError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Oracle for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
            match self.script.lock().unwrap().pop() {
                Some(r) => r,
                None => Ok(format!("echo: {}", request.content)),
            }
        }
    }

    fn no_wait(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    fn limited() -> Result<String, OracleError> {
        Err(OracleError::RateLimited("slow down".into()))
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let oracle = Arc::new(Scripted::new(vec![
            limited(),
            limited(),
            limited(),
            Ok("fine".into()),
        ]));
        let adapter = OracleAdapter::new(oracle, no_wait(5), 2);
        let out = adapter.summarize("x", "y", 10, 0.0).await.unwrap();
        assert_eq!(out, "fine");
        assert_eq!(adapter.calls(), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let oracle = Arc::new(Scripted::new(vec![limited(), limited(), limited()]));
        let adapter = OracleAdapter::new(oracle, no_wait(2), 1);
        let err = adapter.summarize("x", "y", 10, 0.0).await.unwrap_err();
        assert!(matches!(err, OracleError::RateLimited(_)));
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_not_retried() {
        let oracle = Arc::new(Scripted::new(vec![Err(OracleError::Unavailable(
            "down".into(),
        ))]));
        let adapter = OracleAdapter::new(oracle, no_wait(5), 1);
        let err = adapter.summarize("x", "y", 10, 0.0).await.unwrap_err();
        assert_eq!(err, OracleError::Unavailable("down".into()));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_disabled_oracle() {
        let adapter = OracleAdapter::new(Arc::new(DisabledOracle), no_wait(5), 1);
        assert!(matches!(
            adapter.detect_tool_usage("*.nix", 0.3).await,
            Err(OracleError::Unavailable(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(9), Duration::from_secs(32));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(429, "", 1, 2),
            OracleError::RateLimited(_)
        ));
        assert_eq!(
            classify_failure(400, "{\"code\":\"context_length_exceeded\"}", 9, 5),
            OracleError::BudgetExceeded {
                estimated: 9,
                limit: 5
            }
        );
        assert!(matches!(
            classify_failure(401, "bad key", 1, 2),
            OracleError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure(503, "", 1, 2),
            OracleError::Unavailable(_)
        ));
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "  A summary.  " } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 3 }
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "A summary.");
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }
}
