use std::time::Duration;

use crate::error::Error;
use crate::llm::error_class::{self, ErrorClass};
use crate::llm::types::{ChatRequest, ChatResponse};
use crate::llm::{FragmentStream, ModelBackend};

/// Configuration for retry behavior on transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial call).
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubled on each retry).
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::RetryBackendConfig> for RetryConfig {
    fn from(r: &crate::config::RetryBackendConfig) -> Self {
        Self {
            max_retries: r.max_retries,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
        }
    }
}

/// Wraps any `ModelBackend` with automatic retry + exponential backoff.
///
/// This decorator sits above the turn engine, which itself never retries.
///
/// Retries on:
/// - HTTP 429 (rate limit)
/// - HTTP 500, 502, 503, 529 (server errors)
/// - Network errors
///
/// Does NOT retry on:
/// - HTTP 400, 401, 403, 404 (client errors; retrying won't help)
/// - Context overflow (resending the same conversation cannot succeed)
/// - Parse/protocol errors (deterministic failures)
///
/// For streaming, only stream *creation* is retried; once fragments are
/// flowing, failures propagate to the consumer.
pub struct RetryingBackend<B> {
    inner: B,
    config: RetryConfig,
}

impl<B> RetryingBackend<B> {
    pub fn new(inner: B, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn with_defaults(inner: B) -> Self {
        Self::new(inner, RetryConfig::default())
    }
}

/// Determine whether an error is transient and worth retrying.
fn is_retryable(err: &Error) -> bool {
    // Context overflow is a 4xx and would fail identically on resend.
    if error_class::classify(err) == ErrorClass::ContextTooLong {
        return false;
    }
    match err {
        Error::Api { status, .. } => matches!(*status, 429 | 500 | 502 | 503 | 529),
        Error::Http(_) => true,
        _ => false,
    }
}

/// Compute the delay for a given attempt using exponential backoff.
/// Attempt 0 = base_delay, attempt 1 = 2*base_delay, etc.
fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = config
        .base_delay
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    delay.min(config.max_delay)
}

impl<B: ModelBackend> RetryingBackend<B> {
    async fn backoff(&self, attempt: u32, last_err: &Error) {
        let delay = compute_delay(&self.config, attempt - 1);
        tracing::warn!(
            attempt = attempt,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %last_err,
            "retrying model call after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

impl<B: ModelBackend> ModelBackend for RetryingBackend<B> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.backoff(attempt, last_err.as_ref().expect("set before retry"))
                    .await;
            }

            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("at least one attempt must have been made"))
    }

    async fn complete_streaming(&self, request: ChatRequest) -> Result<FragmentStream, Error> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.backoff(attempt, last_err.as_ref().expect("set before retry"))
                    .await;
            }

            match self.inner.complete_streaming(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_retryable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("at least one attempt must have been made"))
    }
}
