//! Client-side request cache.
//!
//! This module provides an in-memory query cache that:
//! - Identifies queries by hierarchical [`QueryKey`]s
//! - Serves fresh data without network traffic and stale data while refreshing
//! - Collapses concurrent requests for the same key into one fetch
//! - Retries transient failures with capped exponential backoff
//! - Collects unreferenced entries after a retention window
//! - Refreshes observed entries on an interval, on focus and on reconnect

mod error;
mod key;
mod layer;
mod options;
mod retry;
mod storage;
mod traits;

pub use error::{ErrorClass, FetchError, QueryError};
pub use key::QueryKey;
pub use layer::{QueryClient, Subscription};
pub use options::{ClientDefaults, MutationOptions, QueryOptions};
pub use retry::RetryPolicy;
pub use traits::{CacheSource, QueryResult, QueryStatus};
