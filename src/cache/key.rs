//! Hierarchical cache keys.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// An ordered, immutable sequence of key segments.
///
/// Keys form a prefix hierarchy: `["products", "detail", "42", "prices"]` is a
/// descendant of `["products", "detail"]`, so invalidating the latter reaches
/// the former. Segments are JSON values and compare by value, so two filter
/// objects with the same fields produce the same key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
  /// A single-segment key naming an entity namespace.
  pub fn root(namespace: &str) -> Self {
    Self(vec![Value::from(namespace)])
  }

  pub fn from_segments(segments: Vec<Value>) -> Self {
    Self(segments.into_iter().map(canonical).collect())
  }

  /// This key with exactly one more segment appended.
  pub fn child(&self, segment: impl Into<Value>) -> Self {
    let mut segments = self.0.clone();
    segments.push(canonical(segment.into()));
    Self(segments)
  }

  /// This key with a serialized filter object appended as one segment.
  pub fn child_params<P: Serialize + fmt::Debug>(&self, params: &P) -> Self {
    let segment = serde_json::to_value(params).unwrap_or_else(|e| {
      tracing::warn!(error = %e, "filter not serializable, keying by debug form");
      Value::String(format!("{:?}", params))
    });
    self.child(segment)
  }

  pub fn segments(&self) -> &[Value] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True if `prefix` is a prefix of, or equal to, this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// True if `parent` is a strict prefix of this key.
  pub fn is_descendant_of(&self, parent: &QueryKey) -> bool {
    self.0.len() > parent.0.len() && self.starts_with(parent)
  }

  /// Stable, fixed-length identifier for this key.
  ///
  /// SHA-256 over the canonical JSON encoding (object keys are sorted).
  pub fn fingerprint(&self) -> String {
    let canonical = Value::Array(self.0.clone()).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// `-0.0` and `0.0` compare equal but encode differently; store them as `0.0`.
fn canonical(value: Value) -> Value {
  match value {
    Value::Number(n) if n.is_f64() && n.as_f64() == Some(0.0) => Value::from(0.0),
    Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
    Value::Object(fields) => Value::Object(
      fields
        .into_iter()
        .map(|(name, value)| (name, canonical(value)))
        .collect(),
    ),
    other => other,
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", Value::Array(self.0.clone()))
  }
}
