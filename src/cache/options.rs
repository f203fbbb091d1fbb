//! Per-query and per-mutation policy.

use std::time::Duration;

use super::retry::RetryPolicy;

/// Freshness, retention, retry and refresh policy for a cached query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long after a fetch the data counts as fresh
  pub stale_time: Duration,
  /// How long after a fetch an unreferenced entry is kept
  pub gc_time: Duration,
  pub retry: RetryPolicy,
  /// Refetch stale subscribed entries when the UI regains focus
  pub refetch_on_focus: bool,
  /// Refetch stale subscribed entries when connectivity returns
  pub refetch_on_reconnect: bool,
  /// Periodic refetch while the entry has a subscriber
  pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(10 * 60),
      retry: RetryPolicy::queries(),
      refetch_on_focus: true,
      refetch_on_reconnect: true,
      refetch_interval: Some(Duration::from_secs(5 * 60)),
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_refetch_interval(mut self, interval: Option<Duration>) -> Self {
    self.refetch_interval = interval.filter(|d| !d.is_zero());
    self
  }

  pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
    self.refetch_on_focus = enabled;
    self
  }

  pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
    self.refetch_on_reconnect = enabled;
    self
  }
}

/// Policy for non-cached, mutating operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOptions {
  pub retry: RetryPolicy,
}

impl MutationOptions {
  pub fn new() -> Self {
    Self {
      retry: RetryPolicy::mutations(),
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }
}

impl Default for MutationOptions {
  fn default() -> Self {
    Self::new()
  }
}

/// Defaults applied when a call site does not override them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientDefaults {
  pub queries: QueryOptions,
  pub mutations: MutationOptions,
}
