//! Retry policy shared by every backend call.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::BackendError;

/// How often and how patiently a failed call is repeated.
#[derive(Clone)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub max_attempts: u32,
  /// Delay between attempts
  pub backoff: Duration,
  retryable: fn(&BackendError) -> bool,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, backoff: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      backoff,
      retryable: BackendError::is_retryable,
    }
  }

  /// A single attempt, no retries.
  #[cfg(test)]
  pub fn none() -> Self {
    Self::new(1, Duration::ZERO)
  }

  /// Replace the predicate deciding which errors are worth repeating.
  pub fn with_retryable(mut self, retryable: fn(&BackendError) -> bool) -> Self {
    self.retryable = retryable;
    self
  }

  pub fn should_retry(&self, error: &BackendError) -> bool {
    (self.retryable)(error)
  }

  /// Run `call` until it succeeds, fails with a non-retryable error, or the
  /// attempts are used up. The last error is returned.
  pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, BackendError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
  {
    let mut attempt = 1;
    loop {
      match call().await {
        Ok(value) => return Ok(value),
        Err(e) if attempt < self.max_attempts && self.should_retry(&e) => {
          warn!(
            call = label,
            attempt,
            max_attempts = self.max_attempts,
            error = %e,
            "Backend call failed, retrying"
          );
          attempt += 1;
          if !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff).await;
          }
        }
        Err(e) => return Err(e),
      }
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_secs(1))
  }
}

impl std::fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_attempts", &self.max_attempts)
      .field("backoff", &self.backoff)
      .finish_non_exhaustive()
  }
}
