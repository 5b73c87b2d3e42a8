use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Boxed future returned by a retried operation.
pub type RetryFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryManager {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryManager {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: MAX_RETRY_DELAY.max(base_delay),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.retry_attempts, Duration::from_millis(config.retry_delay_ms))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or `max_retries` extra attempts are spent.
    pub async fn execute_with_retry<F, T, E, R>(&self, mut operation: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> RetryFuture<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.max_retries && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    debug!("Retry attempt {} failed: {}, waiting {:?}", attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
