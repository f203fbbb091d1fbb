use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::api::types::{
  ArchiveListResponse, Chain, ChainCodesResponse, ChainStatsResponse, Product, ProductSearchResponse,
  Store, StorePricesResponse, StoreSearchResponse,
};
use crate::cache::FetchError;
use crate::config::Config;
use crate::params::ParamsBuilder;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Price API client wrapper.
///
/// Every failure is classified into a [`FetchError`] here, so the cache can
/// decide on retries without knowing about HTTP.
#[derive(Clone)]
pub struct ApiClient {
  http: Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(&config.api.base_url, config.timeout(), Config::get_api_token())
  }

  pub fn with_base_url(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid API base URL {}: not a base URL", base_url));
    }

    let mut headers = header::HeaderMap::new();
    headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    if let Some(token) = token {
      let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      value.set_sensitive(true);
      headers.insert(header::AUTHORIZATION, value);
    }

    let http = Client::builder()
      .timeout(timeout)
      .default_headers(headers)
      .user_agent(concat!("cijene/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Endpoint URL from path segments (percent-encoded) and query parameters.
  /// A trailing `""` segment yields a trailing slash.
  pub fn endpoint(&self, segments: &[&str], params: &ParamsBuilder) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    params.apply_to(&mut url);
    url
  }

  /// Search products (`/v1/products/`)
  pub async fn search_products(
    &self,
    params: &ParamsBuilder,
  ) -> Result<ProductSearchResponse, FetchError> {
    self.get_json(self.endpoint(&["v1", "products", ""], params)).await
  }

  /// Get a single product by id or EAN
  pub async fn get_product(&self, id: &str) -> Result<Product, FetchError> {
    let url = self.endpoint(&["v1", "products", id, ""], &ParamsBuilder::new());
    self.get_json(url).await
  }

  /// Per-store prices for one or more EANs
  pub async fn get_prices(&self, params: &ParamsBuilder) -> Result<StorePricesResponse, FetchError> {
    self.get_json(self.endpoint(&["v1", "prices", ""], params)).await
  }

  pub async fn search_stores(&self, params: &ParamsBuilder) -> Result<StoreSearchResponse, FetchError> {
    self.get_json(self.endpoint(&["v1", "stores", ""], params)).await
  }

  pub async fn get_store(&self, id: &str) -> Result<Store, FetchError> {
    let url = self.endpoint(&["v1", "stores", id, ""], &ParamsBuilder::new());
    self.get_json(url).await
  }

  pub async fn chain_codes(&self) -> Result<ChainCodesResponse, FetchError> {
    let url = self.endpoint(&["v1", "chains", ""], &ParamsBuilder::new());
    self.get_json(url).await
  }

  pub async fn chain_stats(&self) -> Result<ChainStatsResponse, FetchError> {
    let url = self.endpoint(&["v1", "chain-stats", ""], &ParamsBuilder::new());
    self.get_json(url).await
  }

  /// Every chain code merged with its statistics. Both lists are fetched
  /// concurrently; a chain without stats gets zero counts.
  pub async fn chains(&self) -> Result<Vec<Chain>, FetchError> {
    let (codes, stats) = tokio::try_join!(self.chain_codes(), self.chain_stats())?;
    let stats: HashMap<&str, _> = stats
      .chain_stats
      .iter()
      .map(|s| (s.chain_code.as_str(), s))
      .collect();
    let now = Utc::now().to_rfc3339();

    Ok(
      codes
        .chains
        .iter()
        .map(|code| Chain::from_parts(code, stats.get(code.as_str()).copied(), &now))
        .collect(),
    )
  }

  /// List the daily price archives
  pub async fn archives(&self) -> Result<ArchiveListResponse, FetchError> {
    let url = self.endpoint(&["v0", "list"], &ParamsBuilder::new());
    self.get_json(url).await
  }

  /// Download one daily archive (ZIP bytes)
  pub async fn download_archive(&self, date: &str) -> Result<Vec<u8>, FetchError> {
    let file = format!("{}.zip", date);
    let url = self.endpoint(&["v0", "archive", &file], &ParamsBuilder::new());
    debug!(%url, "GET (download)");

    let response = self
      .http
      .get(url)
      .timeout(DOWNLOAD_TIMEOUT)
      .send()
      .await
      .map_err(classify)?;
    let response = check_status(response).await?;
    let bytes = response.bytes().await.map_err(classify)?;
    Ok(bytes.to_vec())
  }

  /// Check connectivity. Any HTTP response counts as reachable.
  pub async fn health(&self) -> Result<(), FetchError> {
    let url = self.endpoint(&["health"], &ParamsBuilder::new());
    self
      .http
      .get(url)
      .timeout(HEALTH_TIMEOUT)
      .send()
      .await
      .map(|_| ())
      .map_err(classify)
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
    debug!(%url, "GET");
    let response = self.http.get(url).send().await.map_err(classify)?;
    let response = check_status(response).await?;
    response.json::<T>().await.map_err(classify)
  }
}

#[derive(Deserialize)]
struct ErrorBody {
  message: String,
}

/// Turn a non-success response into `FetchError::Status`, keeping the
/// server's message when the body carries one.
async fn check_status(response: Response) -> Result<Response, FetchError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ErrorBody>(&body)
    .map(|b| b.message)
    .ok()
    .filter(|m| !m.is_empty())
    .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

  Err(FetchError::status(status.as_u16(), message))
}

fn classify(error: reqwest::Error) -> FetchError {
  if error.is_timeout() {
    FetchError::Timeout
  } else if error.is_decode() {
    FetchError::Decode(error.to_string())
  } else if let Some(status) = error.status() {
    FetchError::status(status.as_u16(), error.to_string())
  } else {
    FetchError::network(error.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::testing::serve;
  use crate::cache::ErrorClass;

  fn client(base_url: &str) -> ApiClient {
    ApiClient::with_base_url(base_url, Duration::from_secs(2), None).unwrap()
  }

  #[test]
  fn test_endpoint_encodes_segments_and_params() {
    let api = client("https://cijene.example/");
    let mut params = ParamsBuilder::new();
    params.add("q", "kruh i mlijeko").add_array("chains", ["konzum", "lidl"]);

    assert_eq!(
      api.endpoint(&["v1", "products", ""], &params).as_str(),
      "https://cijene.example/v1/products/?q=kruh+i+mlijeko&chains=konzum&chains=lidl"
    );
    assert_eq!(
      api.endpoint(&["v1", "products", "a/b", ""], &ParamsBuilder::new()).as_str(),
      "https://cijene.example/v1/products/a%2Fb/"
    );
    assert_eq!(
      api.endpoint(&["v0", "archive", "2025-06-01.zip"], &ParamsBuilder::new()).as_str(),
      "https://cijene.example/v0/archive/2025-06-01.zip"
    );
  }

  #[test]
  fn test_rejects_bad_base_url() {
    assert!(ApiClient::with_base_url("not a url", Duration::from_secs(1), None).is_err());
    assert!(ApiClient::with_base_url("mailto:x@y.z", Duration::from_secs(1), None).is_err());
  }

  #[tokio::test]
  async fn test_decodes_success_body() {
    let server = serve(|_| (200, r#"{"chains": ["konzum", "lidl"]}"#.to_string())).await;
    let codes = client(&server.base_url).chain_codes().await.unwrap();

    assert_eq!(codes.chains, vec!["konzum", "lidl"]);
    assert_eq!(server.requests(), vec!["/v1/chains/"]);
  }

  #[tokio::test]
  async fn test_status_errors_keep_server_message() {
    let server = serve(|path| {
      if path.starts_with("/v1/products/") {
        (404, r#"{"message": "no such product"}"#.to_string())
      } else {
        (503, "upstream down".to_string())
      }
    })
    .await;
    let api = client(&server.base_url);

    let missing = api.get_product("123").await.unwrap_err();
    assert_eq!(missing, FetchError::status(404, "no such product"));
    assert_eq!(missing.class(), ErrorClass::Client);

    let down = api.chain_stats().await.unwrap_err();
    assert_eq!(down, FetchError::status(503, "Service Unavailable"));
    assert!(down.is_retryable());
  }

  #[tokio::test]
  async fn test_malformed_body_is_decode_error() {
    let server = serve(|_| (200, "{not json".to_string())).await;
    let err = client(&server.base_url).archives().await.unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_transient() {
    let err = client("http://127.0.0.1:1").health().await.unwrap_err();
    assert!(matches!(err, FetchError::Network(_) | FetchError::Timeout));
    assert!(err.is_retryable());
  }
}
