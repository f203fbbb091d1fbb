mod cached_client;
pub mod client;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;
pub mod validate;

use thiserror::Error;

use crate::cache::{FetchError, QueryError};

pub use cached_client::CachedApiClient;
pub use client::ApiClient;

/// Failure of a cached API call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
  /// Rejected before any request was made.
  #[error("invalid {field}: {reason}")]
  Invalid { field: &'static str, reason: String },

  #[error("{0} not found")]
  NotFound(String),

  /// Every attempt got a body that could not be decoded.
  #[error("malformed response: {0}")]
  Decode(String),

  #[error(transparent)]
  Query(QueryError),
}

impl From<QueryError> for ApiError {
  fn from(error: QueryError) -> Self {
    match error {
      QueryError::ExhaustedRetries {
        last: FetchError::Decode(message),
        ..
      } => Self::Decode(message),
      other => Self::Query(other),
    }
  }
}

impl ApiError {
  /// Whether the server reported the resource as missing.
  pub fn is_not_found(&self) -> bool {
    match self {
      Self::NotFound(_) => true,
      Self::Query(e) => e.status_code() == Some(404),
      _ => false,
    }
  }
}
