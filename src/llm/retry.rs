//! Timeout and bounded retry around any `LlmProvider`.
//!
//! Every call is capped by `timeout`. Transient failures (see
//! [`LlmError::is_retryable`]) are retried up to `max_retries` times with
//! exponential backoff plus jitter. Final rejections return immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Retry schedule for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u64 << attempt.min(16);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Provider decorator that applies a [`RetryPolicy`].
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            let outcome = tokio::time::timeout(self.policy.timeout, self.inner.complete(request.clone())).await;
            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout {
                    provider: self.inner.model_name().to_string(),
                    after: self.policy.timeout,
                },
            };

            if !err.is_retryable() || attempt >= self.policy.max_retries {
                return Err(err);
            }

            let delay = match &err {
                LlmError::RateLimited {
                    retry_after: Some(after),
                    ..
                } => (*after).min(Duration::from_millis(self.policy.max_delay_ms)),
                _ => self.policy.jittered(attempt),
            };
            warn!(
                model = self.inner.model_name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient LLM failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
