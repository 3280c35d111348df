//! Retry policy with exponential backoff for provider invocations.
//!
//! Backoff doubles per attempt up to the configured ceiling. Only transient
//! provider errors are retried; permanent errors return immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::domain::errors::ProviderError;
use crate::domain::models::check::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 0, initial_backoff_ms: 500, max_backoff_ms: 30_000 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self { max_retries, initial_backoff_ms, ..Self::default() }
    }

    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        match config {
            Some(retry) => Self::new(retry.max, retry.backoff_ms),
            None => Self::default(),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Execute an async operation, retrying transient failures. Returns the
    /// final error and the number of retries performed.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(result) => return (Ok(result), attempt),
                Err(err) => {
                    if attempt >= self.max_retries || !err.is_transient() {
                        return (Err(err), attempt);
                    }
                    let backoff = self.backoff_for(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err,
                           "retrying transient provider error");
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
