//! Request validation, applied before any network traffic.

use chrono::NaiveDate;

use super::ApiError;

pub const MIN_RADIUS_M: f64 = 500.0;
pub const MAX_RADIUS_M: f64 = 50_000.0;

fn invalid(field: &'static str, reason: impl Into<String>) -> ApiError {
  ApiError::Invalid {
    field,
    reason: reason.into(),
  }
}

pub fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ApiError> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(invalid(field, "must not be empty"));
  }
  Ok(trimmed)
}

pub fn positive(value: u32, field: &'static str) -> Result<u32, ApiError> {
  if value == 0 {
    return Err(invalid(field, "must be a positive number"));
  }
  Ok(value)
}

/// EAN barcodes are 8 to 14 digits.
pub fn ean(value: &str) -> Result<(), ApiError> {
  let valid = (8..=14).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit());
  if !valid {
    return Err(invalid("ean", format!("{:?} must be 8-14 digits", value)));
  }
  Ok(())
}

pub fn coordinates(latitude: f64, longitude: f64) -> Result<(), ApiError> {
  if !(-90.0..=90.0).contains(&latitude) {
    return Err(invalid("latitude", "must be between -90 and 90"));
  }
  if !(-180.0..=180.0).contains(&longitude) {
    return Err(invalid("longitude", "must be between -180 and 180"));
  }
  Ok(())
}

/// Search radius in meters.
pub fn radius(meters: f64) -> Result<(), ApiError> {
  if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&meters) {
    return Err(invalid(
      "radius",
      format!("must be between {} and {} meters", MIN_RADIUS_M, MAX_RADIUS_M),
    ));
  }
  Ok(())
}

/// A real calendar date written as `YYYY-MM-DD`.
pub fn date(value: &str) -> Result<NaiveDate, ApiError> {
  if value.len() != 10 {
    return Err(invalid("date", "must be in YYYY-MM-DD format"));
  }
  NaiveDate::parse_from_str(value, "%Y-%m-%d")
    .map_err(|e| invalid("date", format!("{:?} is not a valid date: {}", value, e)))
}

/// Chain codes are 2 to 10 characters of letters, digits, `-` and `_`.
pub fn chain_code(value: &str) -> Result<(), ApiError> {
  if !(2..=10).contains(&value.len()) {
    return Err(invalid("chain_code", "must be between 2 and 10 characters"));
  }
  if !value
    .bytes()
    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
  {
    return Err(invalid(
      "chain_code",
      "can only contain letters, numbers, hyphens and underscores",
    ));
  }
  Ok(())
}
