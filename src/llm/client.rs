//! Completion client trait and the retry wrapper.
//!
//! Vendor HTTP clients live outside the core: the kernel sees an opaque
//! `complete(prompt) -> text` capability. The wrapper adds a deadline,
//! bounded retries with exponential backoff for transient failures, and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A single LLM completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// System prompt
    pub system: Option<String>,
    /// User-visible prompt body
    pub prompt: String,
    /// Response length cap in tokens
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Create a request with the default token cap.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 4096,
        }
    }

    /// Attach a system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Override the token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// The opaque completion capability.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete a prompt into raw text.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Retry configuration for completion calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Backoff multiplier per attempt
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Configuration for the wrapper.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Per-call deadline (default 10 minutes)
    pub timeout_ms: u64,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 600_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Deadline/retry/cancellation wrapper over any completion client.
pub struct RetryingClient {
    inner: Arc<dyn CompletionClient>,
    config: LlmConfig,
}

impl RetryingClient {
    /// Wrap a client.
    pub fn new(inner: Arc<dyn CompletionClient>, config: LlmConfig) -> Self {
        Self { inner, config }
    }

    /// Complete with deadline, bounded retries, and cancellation.
    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let mut attempt = 0u32;
        loop {
            let call = self.inner.complete(request.clone());
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::LlmCallFailed("cancelled".to_string()));
                }
                r = tokio::time::timeout(deadline, call) => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::LlmCallFailed(format!(
                        "timed out after {}ms",
                        deadline.as_millis()
                    ))),
                },
            };

            match result {
                Ok(text) => {
                    debug!(attempt, chars = text.len(), "completion succeeded");
                    return Ok(text);
                }
                Err(e) if e.is_retriable() && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying completion");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Test double replaying a fixed script of responses.
///
/// Each `complete` call pops the next scripted entry; an `Err` entry
/// simulates a transient failure. Exhausting the script fails the call.
pub struct ScriptedClient {
    responses: Mutex<Vec<Result<String>>>,
}

impl ScriptedClient {
    /// Create a client that replays `responses` in order.
    pub fn new(responses: Vec<Result<String>>) -> Self {
        let mut responses = responses;
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
        }
    }

    /// Client that always answers with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![Ok(text)])
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        let mut responses = self.responses.lock().await;
        match responses.len() {
            0 => Err(Error::LlmCallFailed("scripted client exhausted".to_string())),
            1 => {
                // Keep replaying the final entry.
                match &responses[0] {
                    Ok(text) => Ok(text.clone()),
                    Err(_) => responses.pop().expect("len checked"),
                }
            }
            _ => responses.pop().expect("len checked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let scripted = Arc::new(ScriptedClient::new(vec![
            Err(Error::LlmCallFailed("rate limited".into())),
            Ok("recovered".into()),
        ]));
        let client = RetryingClient::new(scripted, LlmConfig::default());
        let text = client
            .complete(CompletionRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "recovered");
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let scripted = Arc::new(ScriptedClient::new(vec![
            Err(Error::Config("bad key".into())),
            Ok("should not be reached".into()),
        ]));
        let client = RetryingClient::new(scripted, LlmConfig::default());
        let err = client
            .complete(CompletionRequest::new("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let scripted = Arc::new(ScriptedClient::always("never"));
        let client = RetryingClient::new(scripted, LlmConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .complete(CompletionRequest::new("hi"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LlmCallFailed(_)));
    }

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(2) > policy.delay_for_attempt(0));
    }
}
