//! Bounded retry for idempotent record store operations

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Retry policy applied to every record store call made by the engine
///
/// Store writes are whole-record upserts, so repeating one after a failure
/// cannot double-count.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    max_retries: usize,
    delay: Duration,
}

impl StoreRetry {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_store_retries,
            Duration::from_millis(config.store_retry_delay_ms),
        )
    }

    /// Run `op`, retrying up to `max_retries` more times before returning the last error
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Store operation '{}' attempt {} failed: {}", what, attempt, e);
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Other(format!("{} failed", what))))
    }
}
