use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::EngineSettings;
use crate::error::TradingError;
use crate::Result;

/// Bounds for one external call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.exchange_timeout_secs),
            max_retries: settings.exchange_max_retries,
            initial_backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }

    /// Single attempt with a timeout, for calls that must not be repeated blindly
    pub fn once(&self) -> Self {
        Self {
            max_retries: 0,
            ..*self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op` with a per-attempt timeout and exponential backoff on transient errors
///
/// Non-transient errors are returned immediately. After `max_retries` retries
/// the last error is surfaced; an attempt that timed out becomes `OrderTimeout`.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries + 1;

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(TradingError::OrderTimeout {
                operation: operation.to_string(),
                secs: policy.timeout.as_secs(),
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let backoff = policy.initial_backoff * 2u32.pow(attempt - 1);
                tracing::warn!(
                    "{} failed: {}, retrying in {:?} (attempt {}/{})",
                    operation,
                    e,
                    backoff,
                    attempt,
                    attempts
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(TradingError::ExchangeUnavailable(format!(
        "{}: retries exhausted",
        operation
    )))
}
