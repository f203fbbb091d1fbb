//! In-memory entry table backing the query client.
//!
//! Entries are indexed by [`QueryKey::fingerprint`] and keep the key itself for
//! prefix matching. The table is only ever touched under the client's lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use super::error::{ErrorClass, FetchError, QueryError};
use super::key::QueryKey;
use super::options::QueryOptions;
use super::traits::QueryStatus;

/// Type-erased cached value.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// A fetch that any number of callers can await. Resolves to the value and
/// the instant it was stored at.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<(Payload, Instant), QueryError>>>;

/// Type-erased fetcher, kept so background refreshes can re-run it.
pub(crate) type Fetcher =
  Arc<dyn Fn() -> BoxFuture<'static, Result<Payload, FetchError>> + Send + Sync>;

/// The outstanding fetch for a key. At most one exists per entry.
pub(crate) struct FetchAttempt {
  /// Distinguishes this fetch from a later one for the same key
  pub id: u64,
  /// 1 for the initial try, incremented before each retry
  pub attempt: u32,
  pub last_error: Option<ErrorClass>,
  pub shared: SharedFetch,
  pub abort: AbortHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
  Absent,
  Fresh,
  Stale,
}

pub(crate) struct CacheEntry {
  pub key: QueryKey,
  pub options: QueryOptions,
  pub data: Option<Payload>,
  /// When `data` was fetched
  pub fetched_at: Option<Instant>,
  /// When the last fetch settled, successfully or not
  pub settled_at: Option<Instant>,
  pub invalidated: bool,
  pub error: Option<QueryError>,
  pub fetcher: Option<Fetcher>,
  pub fetch: Option<FetchAttempt>,
  pub subscribers: usize,
  pub interval: Option<JoinHandle<()>>,
  pub gc: Option<JoinHandle<()>>,
}

impl CacheEntry {
  pub fn new(key: QueryKey, options: QueryOptions) -> Self {
    Self {
      key,
      options,
      data: None,
      fetched_at: None,
      settled_at: None,
      invalidated: false,
      error: None,
      fetcher: None,
      fetch: None,
      subscribers: 0,
      interval: None,
      gc: None,
    }
  }

  pub fn freshness(&self, now: Instant) -> Freshness {
    match (&self.data, self.fetched_at) {
      (Some(_), Some(at)) if !self.invalidated && now < at + self.options.stale_time => {
        Freshness::Fresh
      }
      (Some(_), Some(_)) => Freshness::Stale,
      _ => Freshness::Absent,
    }
  }

  /// Retention runs from the last successful fetch; an entry that never
  /// succeeded is kept for `gc_time` after its last failure.
  pub fn collect_at(&self) -> Option<Instant> {
    self
      .fetched_at
      .or(self.settled_at)
      .map(|at| at + self.options.gc_time)
  }

  /// Unreferenced, idle and past its retention window.
  ///
  /// An entry that never settled holds nothing worth keeping once idle.
  pub fn is_collectable(&self, now: Instant) -> bool {
    self.subscribers == 0
      && self.fetch.is_none()
      && self.collect_at().map_or(true, |at| now >= at)
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch.is_some()
  }

  pub fn status(&self, now: Instant) -> QueryStatus {
    if let Some(fetch) = &self.fetch {
      return QueryStatus::Fetching {
        attempt: fetch.attempt,
      };
    }
    if let Some(error) = &self.error {
      return QueryStatus::Failed(error.clone());
    }
    match self.freshness(now) {
      Freshness::Fresh => QueryStatus::Fresh,
      Freshness::Stale => QueryStatus::Stale,
      Freshness::Absent => QueryStatus::Absent,
    }
  }

  /// Stop the in-flight fetch (best effort) and both timers.
  pub fn abort_tasks(&mut self) {
    if let Some(fetch) = self.fetch.take() {
      fetch.abort.abort();
    }
    self.stop_interval();
    self.stop_gc();
  }

  pub fn stop_interval(&mut self) {
    if let Some(handle) = self.interval.take() {
      handle.abort();
    }
  }

  pub fn stop_gc(&mut self) {
    if let Some(handle) = self.gc.take() {
      handle.abort();
    }
  }
}

/// All cache entries, keyed by fingerprint.
#[derive(Default)]
pub(crate) struct EntryTable {
  entries: HashMap<String, CacheEntry>,
}

impl EntryTable {
  pub fn get(&self, fingerprint: &str) -> Option<&CacheEntry> {
    self.entries.get(fingerprint)
  }

  pub fn get_mut(&mut self, fingerprint: &str) -> Option<&mut CacheEntry> {
    self.entries.get_mut(fingerprint)
  }

  /// Look up the entry for `key`, creating an empty one if needed.
  pub fn get_or_insert(&mut self, key: &QueryKey, options: &QueryOptions) -> &mut CacheEntry {
    self
      .entries
      .entry(key.fingerprint())
      .or_insert_with(|| CacheEntry::new(key.clone(), options.clone()))
  }

  /// Remove an entry, stopping everything it owns.
  pub fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
    let mut entry = self.entries.remove(fingerprint)?;
    entry.abort_tasks();
    Some(entry)
  }

  /// Fingerprints of every entry whose key starts with `prefix`.
  pub fn matching(&self, prefix: &QueryKey) -> Vec<String> {
    self
      .entries
      .iter()
      .filter(|(_, entry)| entry.key.starts_with(prefix))
      .map(|(fingerprint, _)| fingerprint.clone())
      .collect()
  }

  pub fn fingerprints(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }

  /// Drop `fingerprint` if it is collectable. Returns whether it was removed.
  pub fn collect_if_expired(&mut self, fingerprint: &str, now: Instant) -> bool {
    let expired = self
      .entries
      .get(fingerprint)
      .is_some_and(|entry| entry.is_collectable(now));
    if expired {
      self.remove(fingerprint);
    }
    expired
  }

  /// Drop every collectable entry. Returns how many were removed.
  pub fn collect_expired(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_collectable(now))
      .map(|(fingerprint, _)| fingerprint.clone())
      .collect();
    for fingerprint in &expired {
      self.remove(fingerprint);
    }
    expired.len()
  }

  /// Remove everything, stopping all owned tasks.
  pub fn clear(&mut self) {
    for (_, mut entry) in self.entries.drain() {
      entry.abort_tasks();
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn settled_entry(at: Instant) -> CacheEntry {
    let mut entry = CacheEntry::new(QueryKey::root("products"), QueryOptions::default());
    entry.data = Some(Arc::new(42u32));
    entry.fetched_at = Some(at);
    entry.settled_at = Some(at);
    entry
  }

  #[test]
  fn test_freshness_window() {
    let t = Instant::now();
    let entry = settled_entry(t);

    assert_eq!(entry.freshness(t), Freshness::Fresh);
    assert_eq!(entry.freshness(t + Duration::from_secs(4 * 60)), Freshness::Fresh);
    assert_eq!(entry.freshness(t + Duration::from_secs(5 * 60)), Freshness::Stale);
    assert_eq!(entry.freshness(t + Duration::from_secs(6 * 60)), Freshness::Stale);
  }

  #[test]
  fn test_invalidated_entry_is_stale() {
    let t = Instant::now();
    let mut entry = settled_entry(t);
    entry.invalidated = true;
    assert_eq!(entry.freshness(t), Freshness::Stale);
    assert_eq!(entry.status(t), QueryStatus::Stale);
  }

  #[test]
  fn test_collectable_only_when_unreferenced_and_expired() {
    let t = Instant::now();
    let mut entry = settled_entry(t);

    assert!(!entry.is_collectable(t + Duration::from_secs(9 * 60)));
    assert!(entry.is_collectable(t + Duration::from_secs(10 * 60)));

    entry.subscribers = 1;
    assert!(!entry.is_collectable(t + Duration::from_secs(11 * 60)));
  }

  #[test]
  fn test_failed_status_wins_over_stale_data() {
    let t = Instant::now();
    let mut entry = settled_entry(t);
    entry.error = Some(QueryError::Cancelled);
    assert_eq!(entry.status(t), QueryStatus::Failed(QueryError::Cancelled));
  }

  #[test]
  fn test_table_prefix_matching() {
    let mut table = EntryTable::default();
    let options = QueryOptions::default();
    let products = QueryKey::root("products");
    let detail = products.child("detail").child("1");
    let stores = QueryKey::root("stores").child("list");

    table.get_or_insert(&detail, &options);
    table.get_or_insert(&products.child("popular"), &options);
    table.get_or_insert(&stores, &options);

    assert_eq!(table.len(), 3);
    assert_eq!(table.matching(&products).len(), 2);
    assert_eq!(table.matching(&detail), vec![detail.fingerprint()]);
    assert!(table.matching(&QueryKey::root("chains")).is_empty());
  }

  #[test]
  fn test_collect_expired() {
    let t = Instant::now();
    let mut table = EntryTable::default();
    let key = QueryKey::root("archives").child("list");
    *table.get_or_insert(&key, &QueryOptions::default()) = settled_entry(t);

    assert_eq!(table.collect_expired(t + Duration::from_secs(60)), 0);
    assert_eq!(table.collect_expired(t + Duration::from_secs(11 * 60)), 1);
    assert_eq!(table.len(), 0);
  }
}
