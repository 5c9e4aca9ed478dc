//! Bounded-retry wrapper around a single backend call.

use std::time::Duration;

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::language_model::{InvokeOptions, LanguageModel, LanguageModelError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::text::clean_response;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Responses shorter than this (in chars, after cleaning) count as
    /// transient failures.
    pub min_response_chars: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, min_response_chars: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            min_response_chars,
        }
    }

    /// Wait before attempt `attempt + 1`: `2^attempt * base`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1_000), 10)
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(
            config.invoke_max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            config.min_response_chars,
        )
    }
}

#[derive(Debug, Error)]
pub enum InvokeFailure {
    #[error("model call failed: {0}")]
    Model(#[source] LanguageModelError),
    #[error("response too short ({length} chars, need at least {minimum})")]
    TooShort { length: usize, minimum: usize },
}

#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {cause}")]
pub struct InvokeError {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub cause: InvokeFailure,
}

pub struct Invoker<'a> {
    model: &'a dyn LanguageModel,
    policy: RetryPolicy,
    sink: &'a dyn LogSink,
}

impl<'a> Invoker<'a> {
    pub fn new(model: &'a dyn LanguageModel, policy: RetryPolicy, sink: &'a dyn LogSink) -> Self {
        Self {
            model,
            policy,
            sink,
        }
    }

    /// Invokes with the policy's default attempt ceiling.
    pub async fn call(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        operation: &str,
    ) -> Result<String, InvokeError> {
        self.invoke(prompt, options, self.policy.max_attempts, operation)
            .await
    }

    pub async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        max_attempts: u32,
        operation: &str,
    ) -> Result<String, InvokeError> {
        let max_attempts = max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            let failure = match self.model.invoke(prompt, options).await {
                Ok(raw) => {
                    let cleaned = clean_response(&raw);
                    let length = cleaned.chars().count();
                    if length >= self.policy.min_response_chars && !cleaned.is_empty() {
                        return Ok(cleaned);
                    }
                    InvokeFailure::TooShort {
                        length,
                        minimum: self.policy.min_response_chars,
                    }
                }
                Err(err) => InvokeFailure::Model(err),
            };

            self.sink.log(LogRecord::new(
                LogLevel::Warn,
                format!("{operation} 第{attempt}/{max_attempts}次调用失败：{failure}"),
            ));

            if attempt < max_attempts {
                let delay = self.policy.delay_after(attempt);
                self.sink.log(LogRecord::new(
                    LogLevel::Debug,
                    format!("{operation} 将在 {delay:?} 后重试"),
                ));
                tokio::time::sleep(delay).await;
            }
            last_failure = Some(failure);
        }

        Err(InvokeError {
            operation: operation.to_string(),
            attempts: max_attempts,
            cause: last_failure.unwrap_or(InvokeFailure::TooShort {
                length: 0,
                minimum: self.policy.min_response_chars,
            }),
        })
    }
}
