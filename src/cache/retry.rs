//! Retry eligibility and backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::{FetchError, QueryError};

/// How many times, and how patiently, a failed fetch is retried.
///
/// Only transient failures are ever retried; see [`FetchError::class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the initial attempt
  pub max_retries: u32,
  /// Delay before the first retry; doubles for each subsequent one
  pub base_delay: Duration,
  /// Upper bound on any single delay
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Default for reads: 3 retries.
  pub const fn queries() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }

  /// Default for mutating operations: 2 retries.
  pub const fn mutations() -> Self {
    Self {
      max_retries: 2,
      ..Self::queries()
    }
  }

  pub const fn never() -> Self {
    Self {
      max_retries: 0,
      ..Self::queries()
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// Whether another attempt is allowed after `retries` retries already happened.
  pub fn should_retry(&self, retries: u32, error: &FetchError) -> bool {
    error.is_retryable() && retries < self.max_retries
  }

  /// Delay before retry number `retry` (0-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::queries()
  }
}

/// Run `attempt` until it succeeds, fails terminally, or the policy is exhausted.
///
/// `on_failure` observes every failed attempt (1-based attempt number) before
/// the retry decision is made.
pub(crate) async fn run_with_retry<T, F, Fut>(
  policy: &RetryPolicy,
  label: &str,
  mut attempt: F,
  mut on_failure: impl FnMut(u32, &FetchError),
) -> Result<T, QueryError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, FetchError>>,
{
  let mut retries = 0;
  loop {
    match attempt().await {
      Ok(value) => return Ok(value),
      Err(error) => {
        let attempts = retries + 1;
        on_failure(attempts, &error);

        if !policy.should_retry(retries, &error) {
          debug!(query = label, attempts, %error, "fetch failed terminally");
          return Err(QueryError::from_failure(error, attempts));
        }

        let delay = policy.delay_for(retries);
        warn!(query = label, attempt = attempts, ?delay, %error, "retrying after transient failure");
        tokio::time::sleep(delay).await;
        retries += 1;
      }
    }
  }
}
