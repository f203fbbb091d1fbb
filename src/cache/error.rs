//! Failure classification for fetches and cached queries.

use thiserror::Error;

/// A failed transport operation, classified at the transport boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The server answered with a non-success status.
  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },

  /// The request never produced a response (DNS, refused connection, reset).
  #[error("network error: {0}")]
  Network(String),

  /// The request did not complete in time.
  #[error("request timed out")]
  Timeout,

  /// A response arrived but its body could not be decoded.
  #[error("malformed response: {0}")]
  Decode(String),
}

impl FetchError {
  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Self::Status {
      status,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::Network(message.into())
  }

  /// The HTTP status carried by this error, if any.
  pub fn status_code(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn class(&self) -> ErrorClass {
    match self.status_code() {
      Some(401 | 403) => ErrorClass::Auth,
      Some(status) if (400..500).contains(&status) => ErrorClass::Client,
      _ => ErrorClass::Transient,
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.class() == ErrorClass::Transient
  }
}

/// Retry eligibility of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// 401/403, never retried
  Auth,
  /// Any other 4xx, never retried
  Client,
  /// Everything else: network errors, timeouts, 5xx, undecodable bodies
  Transient,
}

/// Terminal outcome of a query or mutation as seen by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("not authorized (HTTP {status}): {message}")]
  Auth { status: u16, message: String },

  #[error("request rejected (HTTP {status}): {message}")]
  Client { status: u16, message: String },

  #[error("giving up after {attempts} attempts: {last}")]
  ExhaustedRetries { attempts: u32, last: FetchError },

  #[error("fetch panicked")]
  Panicked,

  #[error("cached value for {key} is not a {expected}")]
  TypeMismatch { key: String, expected: &'static str },

  #[error("query was cancelled")]
  Cancelled,

  #[error("query client has been shut down")]
  Shutdown,
}

impl QueryError {
  /// Convert the last failure of a fetch into the error surfaced to callers.
  pub fn from_failure(error: FetchError, attempts: u32) -> Self {
    match error {
      FetchError::Status { status, message } if matches!(status, 401 | 403) => {
        Self::Auth { status, message }
      }
      FetchError::Status { status, message } if (400..500).contains(&status) => {
        Self::Client { status, message }
      }
      last => Self::ExhaustedRetries { attempts, last },
    }
  }

  /// The HTTP status behind this error, if it came from a response.
  pub fn status_code(&self) -> Option<u16> {
    match self {
      Self::Auth { status, .. } | Self::Client { status, .. } => Some(*status),
      Self::ExhaustedRetries { last, .. } => last.status_code(),
      _ => None,
    }
  }
}
