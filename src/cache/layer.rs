//! Query client that orchestrates caching, fetching and background refresh.

use std::any::type_name;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::{FetchError, QueryError};
use super::key::QueryKey;
use super::options::{ClientDefaults, MutationOptions, QueryOptions};
use super::retry::run_with_retry;
use super::storage::{CacheEntry, EntryTable, FetchAttempt, Fetcher, Freshness, Payload, SharedFetch};
use super::traits::{QueryResult, QueryStatus};
use crate::event::ClientEvent;

/// Cache-first query client.
///
/// Owns the entry table and every timer attached to it. Cloning is cheap and
/// clones share the same cache. At most one fetch is outstanding per key: a
/// request for a key that is already being fetched waits for that fetch.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

struct Inner {
  table: Mutex<EntryTable>,
  defaults: ClientDefaults,
  shut_down: AtomicBool,
  next_fetch_id: AtomicU64,
  listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryClient {
  /// Create a new client with the given defaults.
  pub fn new(defaults: ClientDefaults) -> Self {
    Self {
      inner: Arc::new(Inner {
        table: Mutex::new(EntryTable::default()),
        defaults,
        shut_down: AtomicBool::new(false),
        next_fetch_id: AtomicU64::new(1),
        listeners: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn defaults(&self) -> &ClientDefaults {
    &self.inner.defaults
  }

  /// Fetch with the client's default query options.
  pub async fn get_or_fetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
  ) -> Result<QueryResult<T>, QueryError>
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let options = self.inner.defaults.queries.clone();
    self.get_or_fetch_with(key, options, fetcher).await
  }

  /// Fetch a query with cache-first strategy.
  ///
  /// 1. Fresh entry: return it, no network traffic
  /// 2. Stale or invalidated entry: return it and refresh in the background
  /// 3. Absent or failed entry: join the in-flight fetch or start one
  ///
  /// Transient failures are retried per `options.retry`; the caller only sees
  /// the terminal outcome.
  pub async fn get_or_fetch_with<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: QueryOptions,
    fetcher: F,
  ) -> Result<QueryResult<T>, QueryError>
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.ensure_running()?;
    let fingerprint = key.fingerprint();

    let pending = {
      let mut table = self.inner.table();
      let now = Instant::now();
      table.collect_if_expired(&fingerprint, now);

      let entry = table.get_or_insert(key, &options);
      if entry.options != options {
        entry.options = options;
        entry.stop_interval();
      }
      entry.fetcher = Some(erase(fetcher));
      self.inner.ensure_interval(entry, &fingerprint);

      let freshness = entry.freshness(now);
      let cached = entry.data.clone().zip(entry.fetched_at);

      match (freshness, cached) {
        (Freshness::Fresh, Some((data, fetched_at))) => {
          debug!(key = %key, "cache hit");
          return Ok(QueryResult::from_cache(downcast(key, data)?, fetched_at, false));
        }
        (Freshness::Stale, Some((data, fetched_at))) => {
          debug!(key = %key, "stale cache hit, refreshing in background");
          self.inner.start_fetch(&mut table, &fingerprint);
          return Ok(QueryResult::from_cache(downcast(key, data)?, fetched_at, true));
        }
        _ => {
          debug!(key = %key, "cache miss");
          self
            .inner
            .start_fetch(&mut table, &fingerprint)
            .ok_or(QueryError::Cancelled)?
        }
      }
    };

    let (payload, fetched_at) = pending.await?;
    Ok(QueryResult::from_network(downcast(key, payload)?, fetched_at))
  }

  /// Read a cached value without fetching.
  pub fn peek<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<QueryResult<T>> {
    let fingerprint = key.fingerprint();
    let mut table = self.inner.table();
    let now = Instant::now();
    table.collect_if_expired(&fingerprint, now);

    let entry = table.get(&fingerprint)?;
    let data = entry.data.clone()?.downcast::<T>().ok()?;
    let fetched_at = entry.fetched_at?;
    let is_stale = entry.freshness(now) == Freshness::Stale;
    Some(QueryResult::from_cache(data, fetched_at, is_stale))
  }

  /// Seed or overwrite the cached value for `key`, as if it was just fetched.
  pub fn set_data<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
    let fingerprint = key.fingerprint();
    let mut table = self.inner.table();
    let now = Instant::now();

    let entry = table.get_or_insert(key, &self.inner.defaults.queries);
    entry.data = Some(Arc::new(value));
    entry.fetched_at = Some(now);
    entry.settled_at = Some(now);
    entry.invalidated = false;
    entry.error = None;
    if entry.subscribers == 0 {
      self.inner.schedule_gc(entry, &fingerprint);
    }
  }

  /// Current state of `key`.
  pub fn status(&self, key: &QueryKey) -> QueryStatus {
    let fingerprint = key.fingerprint();
    let mut table = self.inner.table();
    let now = Instant::now();
    table.collect_if_expired(&fingerprint, now);

    table
      .get(&fingerprint)
      .map(|entry| entry.status(now))
      .unwrap_or(QueryStatus::Absent)
  }

  /// Mark the key as actively observed until the returned guard is dropped.
  ///
  /// Observed keys are never collected, refresh on their interval, and are
  /// eligible for focus/reconnect refetches.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let fingerprint = key.fingerprint();
    let mut table = self.inner.table();

    let entry = table.get_or_insert(key, &self.inner.defaults.queries);
    entry.subscribers += 1;
    entry.stop_gc();
    self.inner.ensure_interval(entry, &fingerprint);

    Subscription {
      inner: Arc::downgrade(&self.inner),
      fingerprint,
    }
  }

  /// Mark every entry under `prefix` stale; refetch the observed ones now.
  ///
  /// Returns the number of entries affected.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let mut table = self.inner.table();
    let matching = table.matching(prefix);

    for fingerprint in &matching {
      let observed = match table.get_mut(fingerprint) {
        Some(entry) => {
          entry.invalidated = true;
          entry.subscribers > 0
        }
        None => false,
      };
      if observed {
        self.inner.start_fetch(&mut table, fingerprint);
      }
    }

    info!(prefix = %prefix, count = matching.len(), "invalidated queries");
    matching.len()
  }

  pub fn invalidate_all(&self) -> usize {
    self.invalidate(&QueryKey::from_segments(Vec::new()))
  }

  /// Drop every entry under `prefix`, aborting their fetches and timers.
  pub fn remove(&self, prefix: &QueryKey) -> usize {
    let mut table = self.inner.table();
    let matching = table.matching(prefix);
    for fingerprint in &matching {
      table.remove(fingerprint);
    }
    info!(prefix = %prefix, count = matching.len(), "removed queries");
    matching.len()
  }

  /// Abandon the in-flight fetch for `key` if nobody observes it.
  ///
  /// Best effort: a request already on the wire may still complete server-side.
  /// Callers waiting on the fetch receive [`QueryError::Cancelled`].
  pub fn cancel(&self, key: &QueryKey) -> bool {
    let fingerprint = key.fingerprint();
    let mut table = self.inner.table();
    let Some(entry) = table.get_mut(&fingerprint) else {
      return false;
    };
    if entry.subscribers > 0 {
      return false;
    }
    let Some(fetch) = entry.fetch.take() else {
      return false;
    };

    fetch.abort.abort();
    debug!(key = %entry.key, "cancelled fetch");
    self.inner.schedule_gc(entry, &fingerprint);
    true
  }

  /// Apply a focus or reconnect trigger. Returns how many refetches started.
  pub fn handle_event(&self, event: ClientEvent) -> usize {
    self.inner.refetch_for_event(event)
  }

  /// Consume an event stream, applying each event as it arrives.
  pub fn listen<S>(&self, events: S)
  where
    S: Stream<Item = ClientEvent> + Send + 'static,
  {
    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let mut events = Box::pin(events);
      while let Some(event) = events.next().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.refetch_for_event(event);
      }
    });
    lock(&self.inner.listeners).push(handle);
  }

  /// Run a non-cached, mutating operation with the mutation retry policy.
  pub async fn mutate<T, F, Fut>(&self, options: &MutationOptions, operation: F) -> Result<T, QueryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
  {
    self.ensure_running()?;
    run_with_retry(&options.retry, "mutation", operation, |_, _| {}).await
  }

  /// Drop expired, unreferenced entries now. Returns how many were removed.
  pub fn collect_garbage(&self) -> usize {
    self.inner.table().collect_expired(Instant::now())
  }

  /// Cancel every fetch, timer and listener and empty the cache.
  ///
  /// The client rejects all further queries with [`QueryError::Shutdown`].
  pub fn shutdown(&self) {
    self.inner.shut_down.store(true, Ordering::SeqCst);
    self.inner.table().clear();
    for handle in lock(&self.inner.listeners).drain(..) {
      handle.abort();
    }
    info!("query client shut down");
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.shut_down.load(Ordering::SeqCst)
  }

  pub fn len(&self) -> usize {
    self.inner.table().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn ensure_running(&self) -> Result<(), QueryError> {
    if self.is_shut_down() {
      return Err(QueryError::Shutdown);
    }
    Ok(())
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new(ClientDefaults::default())
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("entries", &self.len())
      .field("shut_down", &self.is_shut_down())
      .finish_non_exhaustive()
  }
}

impl Inner {
  fn table(&self) -> MutexGuard<'_, EntryTable> {
    lock(&self.table)
  }

  /// Start a fetch for `fingerprint`, or join the one already in flight.
  ///
  /// Returns `None` if the entry is gone or has no fetcher yet.
  fn start_fetch(self: &Arc<Self>, table: &mut EntryTable, fingerprint: &str) -> Option<SharedFetch> {
    if self.shut_down.load(Ordering::SeqCst) {
      return None;
    }
    let entry = table.get_mut(fingerprint)?;
    if let Some(fetch) = &entry.fetch {
      return Some(fetch.shared.clone());
    }
    let fetcher = entry.fetcher.clone()?;

    let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
    let policy = entry.options.retry;
    let label = entry.key.to_string();
    let inner = Arc::clone(self);
    let fp = fingerprint.to_string();
    entry.error = None;
    entry.stop_gc();
    debug!(key = %label, "starting fetch");

    let task = tokio::spawn(async move {
      let attempts = run_with_retry(
        &policy,
        &label,
        || (*fetcher)(),
        |attempt, error| inner.record_failure(&fp, id, attempt, error),
      );
      // A panicking fetcher must still settle, or the key stays in flight
      let result = match AssertUnwindSafe(attempts).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
          warn!(key = %label, "fetcher panicked");
          Err(QueryError::Panicked)
        }
      };
      let fetched_at = Instant::now();
      inner.settle(&fp, id, &result, fetched_at);
      result.map(|payload| (payload, fetched_at))
    });

    let abort = task.abort_handle();
    let shared = async move {
      match task.await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Cancelled),
      }
    }
    .boxed()
    .shared();

    entry.fetch = Some(FetchAttempt {
      id,
      attempt: 1,
      last_error: None,
      shared: shared.clone(),
      abort,
    });
    Some(shared)
  }

  fn record_failure(&self, fingerprint: &str, id: u64, attempt: u32, error: &FetchError) {
    let mut table = self.table();
    let Some(fetch) = table
      .get_mut(fingerprint)
      .and_then(|entry| entry.fetch.as_mut())
      .filter(|fetch| fetch.id == id)
    else {
      return;
    };
    fetch.attempt = attempt + 1;
    fetch.last_error = Some(error.class());
  }

  /// Record the outcome of fetch `id` and schedule collection if unobserved.
  fn settle(
    self: &Arc<Self>,
    fingerprint: &str,
    id: u64,
    result: &Result<Payload, QueryError>,
    now: Instant,
  ) {
    let mut table = self.table();
    let Some(entry) = table.get_mut(fingerprint) else {
      return;
    };
    if entry.fetch.as_ref().map(|fetch| fetch.id) != Some(id) {
      return;
    }

    entry.fetch = None;
    entry.settled_at = Some(now);
    match result {
      Ok(payload) => {
        entry.data = Some(Arc::clone(payload));
        entry.fetched_at = Some(now);
        entry.invalidated = false;
        entry.error = None;
        debug!(key = %entry.key, "fetch succeeded");
      }
      Err(error) => {
        warn!(key = %entry.key, %error, "fetch failed");
        entry.error = Some(error.clone());
      }
    }

    if entry.subscribers == 0 {
      self.schedule_gc(entry, fingerprint);
    }
  }

  fn unsubscribe(self: &Arc<Self>, fingerprint: &str) {
    let mut table = self.table();
    let Some(entry) = table.get_mut(fingerprint) else {
      return;
    };
    entry.subscribers = entry.subscribers.saturating_sub(1);
    if entry.subscribers == 0 {
      entry.stop_interval();
      self.schedule_gc(entry, fingerprint);
    }
  }

  /// Arm the collection timer for an unobserved entry.
  fn schedule_gc(self: &Arc<Self>, entry: &mut CacheEntry, fingerprint: &str) {
    entry.stop_gc();
    if self.shut_down.load(Ordering::SeqCst) || tokio::runtime::Handle::try_current().is_err() {
      return;
    }
    let collect_at = entry.collect_at().unwrap_or_else(Instant::now);
    let weak = Arc::downgrade(self);
    let fp = fingerprint.to_string();

    entry.gc = Some(tokio::spawn(async move {
      tokio::time::sleep_until(collect_at).await;
      if let Some(inner) = weak.upgrade() {
        inner.collect(&fp);
      }
    }));
  }

  fn collect(&self, fingerprint: &str) {
    if self.table().collect_if_expired(fingerprint, Instant::now()) {
      debug!(fingerprint, "collected unreferenced entry");
    }
  }

  /// Start the periodic refresh if the entry is observed and has an interval.
  fn ensure_interval(self: &Arc<Self>, entry: &mut CacheEntry, fingerprint: &str) {
    if entry.subscribers == 0 || entry.interval.is_some() {
      return;
    }
    let Some(period) = entry.options.refetch_interval else {
      return;
    };
    entry.interval = Some(self.spawn_interval(fingerprint.to_string(), period));
  }

  fn spawn_interval(self: &Arc<Self>, fingerprint: String, period: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.refetch(&fingerprint);
      }
    })
  }

  /// Interval refresh. A failed entry waits for an explicit request.
  fn refetch(self: &Arc<Self>, fingerprint: &str) {
    let mut table = self.table();
    if table
      .get(fingerprint)
      .is_some_and(|entry| !entry.is_fetching() && entry.error.is_none())
    {
      debug!(fingerprint, "interval refetch");
      self.start_fetch(&mut table, fingerprint);
    }
  }

  fn refetch_for_event(self: &Arc<Self>, event: ClientEvent) -> usize {
    let mut table = self.table();
    let now = Instant::now();
    let mut started = 0;

    for fingerprint in table.fingerprints() {
      let eligible = table.get(&fingerprint).is_some_and(|entry| {
        let enabled = match event {
          ClientEvent::FocusGained => entry.options.refetch_on_focus,
          ClientEvent::Reconnected => entry.options.refetch_on_reconnect,
        };
        enabled
          && entry.subscribers > 0
          && !entry.is_fetching()
          && entry.error.is_none()
          && entry.freshness(now) == Freshness::Stale
      });
      if eligible && self.start_fetch(&mut table, &fingerprint).is_some() {
        started += 1;
      }
    }

    info!(?event, refetched = started, "applied refresh trigger");
    started
  }
}

/// RAII guard keeping a key observed. See [`QueryClient::subscribe`].
#[derive(Debug)]
pub struct Subscription {
  inner: Weak<Inner>,
  fingerprint: String,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.unsubscribe(&self.fingerprint);
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn erase<T, F, Fut>(fetcher: F) -> Fetcher
where
  T: Send + Sync + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    async move { fut.await.map(|value| Arc::new(value) as Payload) }.boxed()
  })
}

fn downcast<T: Send + Sync + 'static>(key: &QueryKey, payload: Payload) -> Result<Arc<T>, QueryError> {
  payload.downcast::<T>().map_err(|_| QueryError::TypeMismatch {
    key: key.to_string(),
    expected: type_name::<T>(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use std::sync::atomic::AtomicU32;

  fn counting_fetcher(
    calls: &Arc<AtomicU32>,
    delay: Duration,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<u32, FetchError>> + Send + Sync + 'static
  {
    let calls = Arc::clone(calls);
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      async move {
        tokio::time::sleep(delay).await;
        Ok(n)
      }
      .boxed()
    }
  }

  fn failing_fetcher(
    calls: &Arc<AtomicU32>,
    error: FetchError,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<u32, FetchError>> + Send + Sync + 'static
  {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let error = error.clone();
      async move { Err(error) }.boxed()
    }
  }

  fn key() -> QueryKey {
    QueryKey::root("products").child("detail").child("42")
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_hit_does_not_refetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let first = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(*first.data, 1);

    let second = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(*second.data, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_requests_share_one_fetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let key = key();

    let (a, b) = tokio::join!(
      client.get_or_fetch(&key, counting_fetcher(&calls, Duration::from_millis(100))),
      client.get_or_fetch(&key, counting_fetcher(&calls, Duration::from_millis(100))),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*a.unwrap().data, 1);
    assert_eq!(*b.unwrap().data, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_keys_fetch_independently() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let key = key();
    let other = QueryKey::root("stores").child("detail").child("42");

    let (a, b) = tokio::join!(
      client.get_or_fetch(&key, counting_fetcher(&calls, Duration::from_millis(100))),
      client.get_or_fetch(&other, counting_fetcher(&calls, Duration::from_millis(100))),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.len(), 2);
  }

  #[tokio::test]
  async fn test_auth_error_is_not_retried() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::status(401, "expired")))
      .await;

    assert!(matches!(result, Err(QueryError::Auth { status: 401, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
      client.status(&key()),
      QueryStatus::Failed(QueryError::Auth { .. })
    ));
  }

  #[tokio::test]
  async fn test_client_error_is_not_retried() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::status(404, "missing")))
      .await;

    assert!(matches!(result, Err(QueryError::Client { status: 404, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_errors_exhaust_after_four_attempts() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::network("unreachable")))
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
      result.unwrap_err(),
      QueryError::ExhaustedRetries {
        attempts: 4,
        last: FetchError::network("unreachable"),
      }
    );
    assert!(matches!(
      client.status(&key()),
      QueryStatus::Failed(QueryError::ExhaustedRetries { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_undecodable_body_is_retried() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::Decode("eof".into())))
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
      result.unwrap_err(),
      QueryError::ExhaustedRetries {
        attempts: 4,
        last: FetchError::Decode("eof".into()),
      }
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_key_restarts_on_new_request() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let failed = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::status(400, "bad")))
      .await;
    assert!(failed.is_err());

    let recovered = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(recovered.source, CacheSource::Network);
    assert_eq!(client.status(&key()), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_fetcher_settles_the_key() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let result = client
      .get_or_fetch(&key(), || async {
        let ids: Vec<u32> = Vec::new();
        Ok::<_, FetchError>(ids[0])
      })
      .await;
    assert_eq!(result.unwrap_err(), QueryError::Panicked);
    assert_eq!(client.status(&key()), QueryStatus::Failed(QueryError::Panicked));

    let recovered = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(recovered.source, CacheSource::Network);
    assert_eq!(*recovered.data, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_result_reports_stored_fetch_time() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let query_key = key();
    let request = client.get_or_fetch(&query_key, counting_fetcher(&calls, Duration::from_millis(50)));
    tokio::pin!(request);
    assert!(futures::poll!(&mut request).is_pending());

    // The fetch settles long before the caller is polled again
    tokio::time::sleep(Duration::from_secs(1)).await;
    let result = request.await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    let cached = client.peek::<u32>(&key()).unwrap();
    assert_eq!(result.fetched_at, cached.fetched_at);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_observed_entry_waits_for_explicit_request() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let _subscription = client.subscribe(&key());

    let failed = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::status(401, "expired")))
      .await;
    assert!(failed.is_err());

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(client.handle_event(ClientEvent::FocusGained), 0);
    assert_eq!(client.handle_event(ClientEvent::Reconnected), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
      client.status(&key()),
      QueryStatus::Failed(QueryError::Auth { .. })
    ));

    let recovered = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(*recovered.data, 2);
    assert_eq!(client.status(&key()), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retention_counts_from_last_successful_fetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    let stale = client
      .get_or_fetch(&key(), failing_fetcher(&calls, FetchError::status(503, "down")))
      .await
      .unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);

    // Background refresh gives up after its retries
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(matches!(
      client.status(&key()),
      QueryStatus::Failed(QueryError::ExhaustedRetries { .. })
    ));

    // Ten minutes after the successful fetch, not after the failure
    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    assert_eq!(client.status(&key()), QueryStatus::Absent);
    assert!(client.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_freshness_and_collection_timeline() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_secs(4 * 60)).await;
    assert_eq!(client.status(&key()), QueryStatus::Fresh);

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    assert_eq!(client.status(&key()), QueryStatus::Stale);

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    assert_eq!(client.status(&key()), QueryStatus::Absent);
    assert!(client.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_served_and_refreshed() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    let stale = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::from_millis(50)))
      .await
      .unwrap();
    assert_eq!(stale.source, CacheSource::CacheStale);
    assert_eq!(*stale.data, 1);
    assert!(matches!(client.status(&key()), QueryStatus::Fetching { attempt: 1 }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let fresh = client.peek::<u32>(&key()).unwrap();
    assert_eq!(*fresh.data, 2);
    assert_eq!(client.status(&key()), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscription_prevents_collection_and_refreshes_on_interval() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let subscription = client.subscribe(&key());
    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    assert!(calls.load(Ordering::SeqCst) >= 4);
    assert!(!client.is_empty());

    drop(subscription);
    let refreshes = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), refreshes);
    assert_eq!(client.status(&key()), QueryStatus::Absent);
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_refetches_stale_observed_entries_once() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_refetch_interval(None);

    let _subscription = client.subscribe(&key());
    client
      .get_or_fetch_with(&key(), options, counting_fetcher(&calls, Duration::from_millis(50)))
      .await
      .unwrap();

    assert_eq!(client.handle_event(ClientEvent::FocusGained), 0);

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    assert_eq!(client.handle_event(ClientEvent::FocusGained), 1);
    assert_eq!(client.handle_event(ClientEvent::Reconnected), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_focus_ignores_unobserved_and_disabled_entries() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let unobserved = QueryKey::root("chains").child("list");

    client
      .get_or_fetch(&unobserved, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    let options = QueryOptions::default()
      .with_refetch_interval(None)
      .with_refetch_on_focus(false);
    let _subscription = client.subscribe(&key());
    client
      .get_or_fetch_with(&key(), options, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    assert_eq!(client.handle_event(ClientEvent::FocusGained), 0);
    assert_eq!(client.handle_event(ClientEvent::Reconnected), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_listen_applies_event_stream() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default().with_refetch_interval(None);

    let _subscription = client.subscribe(&key());
    client
      .get_or_fetch_with(&key(), options, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(6 * 60)).await;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    client.listen(tokio_stream_from(rx));
    tx.send(ClientEvent::Reconnected).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  fn tokio_stream_from(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
  ) -> impl Stream<Item = ClientEvent> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_by_prefix() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let stores = QueryKey::root("stores").child("list");

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    client
      .get_or_fetch(&stores, counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(client.invalidate(&QueryKey::root("products")), 1);
    assert_eq!(client.status(&key()), QueryStatus::Stale);
    assert_eq!(client.status(&stores), QueryStatus::Fresh);

    let refreshed = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(refreshed.source, CacheSource::CacheStale);

    assert_eq!(client.remove(&QueryKey::root("stores")), 1);
    assert_eq!(client.status(&stores), QueryStatus::Absent);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_refetches_observed_entries() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let _subscription = client.subscribe(&key());
    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    client.invalidate_all();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.status(&key()), QueryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_unobserved_fetch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    let waiting = {
      let client = client.clone();
      let fetcher = counting_fetcher(&calls, Duration::from_secs(10));
      tokio::spawn(async move { client.get_or_fetch(&key(), fetcher).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(client.cancel(&key()));
    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(QueryError::Cancelled)));
    assert!(!client.cancel(&key()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_type_mismatch() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();

    let result = client
      .get_or_fetch(&key(), || async { Ok::<_, FetchError>("text".to_string()) })
      .await;
    assert!(matches!(result, Err(QueryError::TypeMismatch { .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_data_and_peek() {
    let client = QueryClient::default();
    assert!(client.peek::<u32>(&key()).is_none());

    client.set_data(&key(), 7u32);
    let cached = client.peek::<u32>(&key()).unwrap();
    assert_eq!(*cached.data, 7);
    assert_eq!(cached.source, CacheSource::CacheFresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_retries_twice() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);

    let result: Result<(), _> = client
      .mutate(&MutationOptions::default(), || {
        seen.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::status(503, "unavailable")) }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(
      result,
      Err(QueryError::ExhaustedRetries { attempts: 3, .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_rejects_further_queries() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicU32::new(0));
    let _subscription = client.subscribe(&key());

    client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await
      .unwrap();
    client.shutdown();

    assert!(client.is_empty());
    let result = client
      .get_or_fetch(&key(), counting_fetcher(&calls, Duration::ZERO))
      .await;
    assert_eq!(result.unwrap_err(), QueryError::Shutdown);

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
