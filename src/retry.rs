//! Retry policy with exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;
use log::{debug, warn};

/// Retry policy for failed requests
#[derive(Debug, Clone)]
pub struct RetryPolicy
{   /// Attempts allowed after the first one
    pub max_retries: usize
  , pub backoff_multiplier: f32
  , pub initial_backoff: Duration
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(
      max_retries: usize
    , backoff_multiplier: f32
    , initial_backoff_ms: u64
    ) -> Self
    {   RetryPolicy
        {   max_retries
          , backoff_multiplier
          , initial_backoff: Duration::from_millis(
              initial_backoff_ms
            )
        }
    }

    /// A policy that never retries
    pub fn none() -> Self
    {   RetryPolicy::new(0, 1.0, 0)
    }

    pub fn max_attempts(&self) -> usize
    {   self.max_retries + 1
    }

    /// Backoff before retry number `retry` (0-based)
    pub fn backoff_for_attempt(
      &self
    , retry: usize
    ) -> Duration
    {   let multiplier
          = self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(
          (self.initial_backoff.as_millis() as f32
            * multiplier) as u64
        )
    }

    /// Worst-case time spent sleeping between attempts
    pub fn total_backoff(&self) -> Duration
    {   (0..self.max_retries)
          .map(|r| self.backoff_for_attempt(r))
          .sum()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error,
    /// or attempts run out. The last error is returned on exhaustion.
    pub async fn run<T, E, F, Fut>(
      &self
    , mut op: F
    , is_retryable: impl Fn(&E) -> bool
    ) -> Result<T, E>
    where
      F: FnMut(usize) -> Fut
    , Fut: Future<Output = Result<T, E>>
    , E: std::fmt::Display
    {   let mut attempt = 0;
        loop
        {   match op(attempt).await
            {   Ok(value) => {
                  if attempt > 0
                  {   debug!("Succeeded on attempt {}", attempt + 1);
                  }
                  return Ok(value);
                }
              , Err(e) if is_retryable(&e)
                  && attempt < self.max_retries => {
                  let delay = self.backoff_for_attempt(attempt);
                  warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt + 1, self.max_attempts(), e, delay
                  );
                  tokio::time::sleep(delay).await;
                  attempt += 1;
                }
              , Err(e) => {
                  debug!(
                    "Giving up after attempt {}: {}",
                    attempt + 1, e
                  );
                  return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy
{   fn default() -> Self
    {   RetryPolicy::from(&crate::config::RetryConfig::default())
    }
}

impl From<&crate::config::RetryConfig> for RetryPolicy
{   fn from(config: &crate::config::RetryConfig) -> Self
    {   RetryPolicy::new(
          config.max_retries
        , config.backoff_multiplier
        , config.initial_backoff_ms
        )
    }
}
