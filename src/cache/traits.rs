//! Result and status types returned by the query client.

use std::sync::Arc;
use tokio::time::Instant;

use super::error::QueryError;

/// Result of a cached query, including the data and where it came from.
#[derive(Debug)]
pub struct QueryResult<T> {
  /// The actual data
  pub data: Arc<T>,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched
  pub fetched_at: Instant,
}

impl<T> QueryResult<T> {
  pub(crate) fn from_network(data: Arc<T>, fetched_at: Instant) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  pub(crate) fn from_cache(data: Arc<T>, fetched_at: Instant, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      fetched_at,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }
}

impl<T> Clone for QueryResult<T> {
  fn clone(&self) -> Self {
    Self {
      data: Arc::clone(&self.data),
      source: self.source,
      fetched_at: self.fetched_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched for this request (or a request it was deduplicated with)
  Network,
  /// From cache, still fresh
  CacheFresh,
  /// From cache, stale; a background refetch has been started
  CacheStale,
}

/// Observable state of a key in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing cached, nothing in flight
  Absent,
  /// A fetch is in flight; `attempt` is 1 for the initial try
  Fetching { attempt: u32 },
  Fresh,
  Stale,
  /// The last fetch failed terminally; stays observable until a new fetch starts
  Failed(QueryError),
}
