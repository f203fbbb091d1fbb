//! Observer over a cached query, for polling event loops.
//!
//! A `Query<T>` binds one key and fetcher to a [`QueryClient`]. While it is
//! alive the key counts as observed, so the cache keeps it, refreshes it on
//! its interval and on focus/reconnect. Results arrive over a channel and are
//! picked up by `poll()`, which also notices refreshes made in the background
//! or by other observers of the same key.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let mut query = Query::new(&cache, keys::chains::codes(), move || {
//!     let api = api.clone();
//!     async move { api.chain_codes().await }
//! });
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, print or re-render
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{
  FetchError, QueryClient, QueryError, QueryKey, QueryOptions, QueryResult, QueryStatus,
  Subscription,
};

/// The state of a query as last seen by its observer
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Waiting for the first result
  Loading,
  Success(Arc<T>),
  Error(QueryError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&QueryError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;

type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

type Outcome<T> = Result<QueryResult<T>, QueryError>;

/// An observed query. Dropping it releases the observation.
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  fetcher: FetcherFn<T>,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<Outcome<T>>>,
  fetched_at: Option<Instant>,
  _subscription: Subscription,
}

impl<T: Send + Sync + 'static> Query<T> {
  /// Observe `key`, fetching it with `fetcher` when needed.
  ///
  /// Uses the client's default query options until `with_options` is called.
  pub fn new<F, Fut>(client: &QueryClient, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let subscription = client.subscribe(&key);
    Self {
      client: client.clone(),
      options: client.defaults().queries.clone(),
      key,
      fetcher: Arc::new(move || -> BoxFuture<T> { Box::pin(fetcher()) }),
      state: QueryState::Idle,
      receiver: None,
      fetched_at: None,
      _subscription: subscription,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.state.error()
  }

  /// Whether the cached value is past its stale time (or invalidated).
  pub fn is_stale(&self) -> bool {
    matches!(self.client.status(&self.key), QueryStatus::Stale)
  }

  /// When the value currently shown was fetched.
  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// Start fetching unless a fetch is already pending.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start_fetch();
  }

  /// Force fresh data.
  ///
  /// With a value already shown this invalidates the key (and keys under
  /// it); the refreshed value shows up on a later `poll()`.
  pub fn refetch(&mut self) {
    if self.fetched_at.is_none() {
      self.receiver = None;
      self.start_fetch();
      return;
    }
    self.client.invalidate(&self.key);
  }

  /// Poll for results.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    if let Some(receiver) = &mut self.receiver {
      let outcome = match receiver.try_recv() {
        Ok(outcome) => outcome,
        Err(mpsc::error::TryRecvError::Empty) => return false,
        Err(mpsc::error::TryRecvError::Disconnected) => Err(QueryError::Cancelled),
      };
      self.receiver = None;
      match outcome {
        Ok(result) => self.show(result),
        Err(error) => self.state = QueryState::Error(error),
      }
      return true;
    }

    // Refreshes made in the background or through another observer
    match self.client.peek::<T>(&self.key) {
      Some(latest) if Some(latest.fetched_at) != self.fetched_at => {
        self.show(latest);
        true
      }
      _ => false,
    }
  }

  fn show(&mut self, result: QueryResult<T>) {
    self.fetched_at = Some(result.fetched_at);
    self.state = QueryState::Success(result.data);
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.fetched_at.is_none() {
      self.state = QueryState::Loading;
    }

    let client = self.client.clone();
    let key = self.key.clone();
    let options = self.options.clone();
    let fetcher = Arc::clone(&self.fetcher);
    tokio::spawn(async move {
      let result = client
        .get_or_fetch_with(&key, options, move || fetcher())
        .await;
      // Receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}
