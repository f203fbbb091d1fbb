//! Deterministic query-string construction for outbound API requests.
//!
//! `ParamsBuilder` turns partially-filled request structs into an ordered list of
//! `name=value` pairs. It is purely additive: absent values are skipped, repeated
//! names are kept (standard multi-valued query-string semantics), and nothing is
//! ever removed or replaced.

use std::fmt;

use url::{form_urlencoded, Url};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// A scalar that may or may not produce a query parameter value.
///
/// Returning `None` means "absent" and the parameter is skipped.
pub trait IntoParam {
  fn into_param(self) -> Option<String>;
}

impl IntoParam for &str {
  fn into_param(self) -> Option<String> {
    (!self.is_empty()).then(|| self.to_string())
  }
}

impl IntoParam for String {
  fn into_param(self) -> Option<String> {
    (!self.is_empty()).then_some(self)
  }
}

impl IntoParam for &String {
  fn into_param(self) -> Option<String> {
    self.as_str().into_param()
  }
}

impl IntoParam for bool {
  fn into_param(self) -> Option<String> {
    Some(self.to_string())
  }
}

impl IntoParam for f64 {
  fn into_param(self) -> Option<String> {
    self.is_finite().then(|| self.to_string())
  }
}

impl IntoParam for f32 {
  fn into_param(self) -> Option<String> {
    f64::from(self).into_param()
  }
}

macro_rules! int_param {
  ($($ty:ty),*) => {
    $(
      impl IntoParam for $ty {
        fn into_param(self) -> Option<String> {
          Some(self.to_string())
        }
      }
    )*
  };
}

int_param!(i32, i64, u8, u16, u32, u64, usize);

impl<T: IntoParam> IntoParam for Option<T> {
  fn into_param(self) -> Option<String> {
    self.and_then(IntoParam::into_param)
  }
}

/// Builder for URL query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamsBuilder {
  pairs: Vec<(String, String)>,
}

impl ParamsBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a builder with pagination already applied (max 100 per page).
  pub fn with_pagination(page: Option<i64>, per_page: Option<i64>) -> Self {
    let mut builder = Self::new();
    builder.add_pagination(page, per_page, MAX_PER_PAGE);
    builder
  }

  /// Append `name=value` unless the value is absent or empty.
  pub fn add(&mut self, name: &str, value: impl IntoParam) -> &mut Self {
    if let Some(value) = value.into_param() {
      self.pairs.push((name.to_string(), value));
    }
    self
  }

  /// Append one `name=value` pair per element, preserving order.
  pub fn add_array<I, S>(&mut self, name: &str, values: I) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for value in values {
      self.pairs.push((name.to_string(), value.as_ref().to_string()));
    }
    self
  }

  /// Append `page` and `per_page`, clamped into range.
  ///
  /// Never a no-op: absent or non-positive values fall back to page 1 and
  /// `DEFAULT_PER_PAGE`, and `per_page` is capped at `max_per_page`. `page` has
  /// no upper bound.
  pub fn add_pagination(
    &mut self,
    page: Option<i64>,
    per_page: Option<i64>,
    max_per_page: i64,
  ) -> &mut Self {
    let page = page.unwrap_or(DEFAULT_PAGE).max(1);
    let per_page = per_page
      .filter(|p| *p > 0)
      .unwrap_or(DEFAULT_PER_PAGE)
      .min(max_per_page);

    self.pairs.push(("page".to_string(), page.to_string()));
    self.pairs.push(("per_page".to_string(), per_page.to_string()));
    self
  }

  /// Append `latitude` and `longitude`, but only as a complete pair.
  pub fn add_coordinates(&mut self, latitude: Option<f64>, longitude: Option<f64>) -> &mut Self {
    if let (Some(lat), Some(lon)) = (latitude.into_param(), longitude.into_param()) {
      self.pairs.push(("latitude".to_string(), lat));
      self.pairs.push(("longitude".to_string(), lon));
    }
    self
  }

  /// The accumulated pairs in append order.
  pub fn build(&self) -> &[(String, String)] {
    &self.pairs
  }

  /// All values recorded for `name`, in append order.
  pub fn get_all(&self, name: &str) -> Vec<&str> {
    self
      .pairs
      .iter()
      .filter(|(n, _)| n == name)
      .map(|(_, v)| v.as_str())
      .collect()
  }

  pub fn is_empty(&self) -> bool {
    self.pairs.is_empty()
  }

  /// Append the accumulated pairs to `url`'s query string.
  pub fn apply_to(&self, url: &mut Url) {
    if self.pairs.is_empty() {
      return;
    }
    url.query_pairs_mut().extend_pairs(self.pairs.iter());
  }
}

impl fmt::Display for ParamsBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let encoded = form_urlencoded::Serializer::new(String::new())
      .extend_pairs(self.pairs.iter())
      .finish();
    f.write_str(&encoded)
  }
}
