//! Cached API client that wraps ApiClient with the query cache.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{FetchError, QueryClient, QueryKey, QueryResult};
use crate::config::{Config, PaginationConfig};
use crate::keys;

use super::client::ApiClient;
use super::types::{
  Archive, ArchiveListResponse, Chain, ChainSummary, PriceComparison, PriceRequest, Product,
  ProductSearchRequest, ProductSearchResponse, Store, StoreSearchRequest, StoreSearchResponse,
};
use super::{validate, ApiError};

const SUGGESTIONS_STALE: Duration = Duration::from_secs(30);
const POPULAR_STALE: Duration = Duration::from_secs(10 * 60);
const CHAINS_STALE: Duration = Duration::from_secs(30 * 60);
const ARCHIVES_STALE: Duration = Duration::from_secs(60 * 60);
const LATEST_ARCHIVE_STALE: Duration = Duration::from_secs(30 * 60);

const DEFAULT_RADIUS_M: f64 = 5000.0;

/// Price API client with transparent caching.
///
/// Same operations as [`ApiClient`], but every read goes through the query
/// cache under a key from [`crate::keys`], and input is validated before any
/// request is made.
#[derive(Clone)]
pub struct CachedApiClient {
  inner: ApiClient,
  cache: QueryClient,
  pagination: PaginationConfig,
}

impl CachedApiClient {
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    let inner = ApiClient::new(config)?;
    let cache = QueryClient::new(config.client_defaults());
    Ok(Self::with_parts(inner, cache, config.pagination.clone()))
  }

  pub fn with_parts(inner: ApiClient, cache: QueryClient, pagination: PaginationConfig) -> Self {
    Self {
      inner,
      cache,
      pagination,
    }
  }

  pub fn cache(&self) -> &QueryClient {
    &self.cache
  }

  pub fn api(&self) -> &ApiClient {
    &self.inner
  }

  // ==========================================================================
  // Products
  // ==========================================================================

  /// Search products. An EAN-only search looks the product up directly and
  /// reports an unknown EAN as an empty result.
  pub async fn search_products(
    &self,
    request: &ProductSearchRequest,
  ) -> Result<QueryResult<ProductSearchResponse>, ApiError> {
    if let Some(ean) = &request.ean {
      validate::ean(ean)?;
    }
    if let Some(date) = &request.date {
      validate::date(date)?;
    }
    for code in request.chains.iter().chain(&request.chain_code) {
      validate::chain_code(code)?;
    }

    let has_query = request.query.as_deref().is_some_and(|q| !q.trim().is_empty());
    if let (false, Some(ean)) = (has_query, request.ean.clone()) {
      return self
        .query(keys::products::by_ean(&ean), None, move |api| {
          let ean = ean.clone();
          async move {
            match api.get_product(&ean).await {
              Ok(product) => Ok(ProductSearchResponse::single(product)),
              Err(e) if e.status_code() == Some(404) => Ok(ProductSearchResponse::empty()),
              Err(e) => Err(e),
            }
          }
        })
        .await;
    }

    let mut request = request.clone();
    request.per_page = request.per_page.or(Some(self.pagination.default_per_page));
    // Keyed by what goes on the wire, so equivalent filters share an entry
    let params = request.to_params(self.pagination.max_per_page);
    let key = keys::products::list(&params.build());

    self
      .query(key, None, move |api| {
        let params = params.clone();
        async move { api.search_products(&params).await }
      })
      .await
  }

  pub async fn product(&self, id: &str) -> Result<QueryResult<Product>, ApiError> {
    let id = validate::required(id, "id")?.to_string();
    self
      .query(keys::products::detail(&id), None, move |api| {
        let id = id.clone();
        async move { api.get_product(&id).await }
      })
      .await
  }

  pub async fn product_by_ean(&self, ean: &str) -> Result<QueryResult<Product>, ApiError> {
    validate::ean(ean)?;
    self.product(ean).await
  }

  /// First product listed under a chain-specific product code.
  pub async fn product_by_chain_code(&self, code: &str) -> Result<Product, ApiError> {
    let code = validate::required(code, "chain_code")?.to_string();
    let max_per_page = self.pagination.max_per_page;
    let request = ProductSearchRequest {
      chain_code: Some(code.clone()),
      ..ProductSearchRequest::default()
    };
    let params = request.to_params(max_per_page);

    let result = self
      .query(keys::products::by_chain_code(&code), None, move |api| {
        let params = params.clone();
        async move {
          let response = api.search_products(&params).await?;
          Ok::<_, FetchError>(response.products.into_iter().next())
        }
      })
      .await?;

    result
      .data
      .as_ref()
      .clone()
      .ok_or_else(|| ApiError::NotFound(format!("product with chain code {}", code)))
  }

  /// Prices for `product` across stores, with min/max/average.
  pub async fn price_comparison(
    &self,
    product: &Product,
    request: &PriceRequest,
  ) -> Result<QueryResult<PriceComparison>, ApiError> {
    let eans = validate::required(&request.eans, "eans")?;
    for ean in eans.split(',') {
      validate::ean(ean.trim())?;
    }
    if let (Some(lat), Some(lon)) = (request.lat, request.lon) {
      validate::coordinates(lat, lon)?;
    }

    let params = request.to_params();
    let product = product.clone();
    self
      .query(
        keys::products::price_comparison(&product.id, request),
        None,
        move |api| {
          let params = params.clone();
          let product = product.clone();
          async move {
            let response = api.get_prices(&params).await?;
            Ok::<_, FetchError>(PriceComparison::new(product, response.store_prices))
          }
        },
      )
      .await
  }

  /// Look a product up by EAN and compare its prices everywhere.
  pub async fn product_prices(&self, ean: &str) -> Result<QueryResult<PriceComparison>, ApiError> {
    let product = self.product_by_ean(ean).await?;
    self
      .price_comparison(&product.data, &PriceRequest::for_ean(ean))
      .await
  }

  /// Autocomplete suggestions (at most 20).
  pub async fn product_suggestions(&self, query: &str, limit: u32) -> Result<Vec<Product>, ApiError> {
    let query = validate::required(query, "query")?.to_string();
    let limit = validate::positive(limit, "limit")?;
    let request = ProductSearchRequest {
      query: Some(query.clone()),
      page: Some(1),
      per_page: Some(i64::from(limit.min(20))),
      ..ProductSearchRequest::default()
    };
    self
      .product_page(
        keys::products::suggestions(&query).child(limit),
        SUGGESTIONS_STALE,
        request,
      )
      .await
  }

  pub async fn popular_products(&self, limit: u32) -> Result<Vec<Product>, ApiError> {
    let limit = validate::positive(limit, "limit")?;
    let request = ProductSearchRequest {
      page: Some(1),
      per_page: Some(i64::from(limit.min(50))),
      ..ProductSearchRequest::default()
    };
    self
      .product_page(keys::products::popular(limit), POPULAR_STALE, request)
      .await
  }

  async fn product_page(
    &self,
    key: QueryKey,
    stale: Duration,
    request: ProductSearchRequest,
  ) -> Result<Vec<Product>, ApiError> {
    let params = request.to_params(self.pagination.max_per_page);
    let result = self
      .query(key, Some(stale), move |api| {
        let params = params.clone();
        async move { api.search_products(&params).await }
      })
      .await?;
    Ok(result.data.products.clone())
  }

  // ==========================================================================
  // Stores
  // ==========================================================================

  pub async fn search_stores(
    &self,
    request: &StoreSearchRequest,
  ) -> Result<QueryResult<StoreSearchResponse>, ApiError> {
    if let (Some(lat), Some(lon)) = (request.latitude, request.longitude) {
      validate::coordinates(lat, lon)?;
    }
    if let Some(radius) = request.radius {
      validate::radius(radius)?;
    }
    for code in &request.chain_codes {
      validate::chain_code(code)?;
    }

    let mut request = request.clone();
    request.per_page = request.per_page.or(Some(self.pagination.default_per_page));
    let key = keys::stores::list(&request.to_params(self.pagination.max_per_page).build());
    self.store_search(key, None, &request).await
  }

  pub async fn store(&self, id: &str) -> Result<QueryResult<Store>, ApiError> {
    let id = validate::required(id, "id")?.to_string();
    self
      .query(keys::stores::detail(&id), None, move |api| {
        let id = id.clone();
        async move { api.get_store(&id).await }
      })
      .await
  }

  /// Stores within `radius_m` meters (default 5 km) of a point.
  pub async fn nearby_stores(
    &self,
    latitude: f64,
    longitude: f64,
    radius_m: Option<f64>,
    chains: &[String],
  ) -> Result<Vec<Store>, ApiError> {
    let radius = radius_m.unwrap_or(DEFAULT_RADIUS_M);
    validate::coordinates(latitude, longitude)?;
    validate::radius(radius)?;
    for code in chains {
      validate::chain_code(code)?;
    }

    let request = StoreSearchRequest {
      latitude: Some(latitude),
      longitude: Some(longitude),
      radius: Some(radius),
      chain_codes: chains.to_vec(),
      per_page: Some(50),
      ..StoreSearchRequest::default()
    };
    let key = keys::stores::nearby(latitude, longitude, radius / 1000.0, chains);
    let result = self.store_search(key, None, &request).await?;
    Ok(result.data.stores.clone())
  }

  pub async fn stores_by_city(&self, city: &str, chains: &[String]) -> Result<Vec<Store>, ApiError> {
    let city = validate::required(city, "city")?;
    let request = StoreSearchRequest {
      city: Some(city.to_string()),
      chain_codes: chains.to_vec(),
      per_page: Some(50),
      ..StoreSearchRequest::default()
    };
    let result = self
      .store_search(keys::stores::by_city(city, chains), None, &request)
      .await?;
    Ok(result.data.stores.clone())
  }

  pub async fn stores_by_chain(&self, code: &str) -> Result<Vec<Store>, ApiError> {
    validate::chain_code(code)?;
    let request = StoreSearchRequest {
      chain_codes: vec![code.to_string()],
      per_page: Some(100),
      ..StoreSearchRequest::default()
    };
    let result = self
      .store_search(keys::stores::by_chain(code), None, &request)
      .await?;
    Ok(result.data.stores.clone())
  }

  pub async fn store_suggestions(&self, query: &str, limit: u32) -> Result<Vec<Store>, ApiError> {
    let query = validate::required(query, "query")?;
    let limit = validate::positive(limit, "limit")?;
    let request = StoreSearchRequest {
      query: Some(query.to_string()),
      page: Some(1),
      per_page: Some(i64::from(limit.min(20))),
      ..StoreSearchRequest::default()
    };
    let key = keys::stores::suggestions(query).child(limit);
    let result = self
      .store_search(key, Some(SUGGESTIONS_STALE), &request)
      .await?;
    Ok(result.data.stores.clone())
  }

  async fn store_search(
    &self,
    key: QueryKey,
    stale: Option<Duration>,
    request: &StoreSearchRequest,
  ) -> Result<QueryResult<StoreSearchResponse>, ApiError> {
    let params = request.to_params(self.pagination.max_per_page);
    self
      .query(key, stale, move |api| {
        let params = params.clone();
        async move { api.search_stores(&params).await }
      })
      .await
  }

  // ==========================================================================
  // Chains
  // ==========================================================================

  /// All chains, merging the code list with per-chain statistics.
  pub async fn chains(&self) -> Result<QueryResult<Vec<Chain>>, ApiError> {
    self
      .query(keys::chains::lists(), Some(CHAINS_STALE), |api| async move {
        api.chains().await
      })
      .await
  }

  pub async fn chain_codes(&self) -> Result<QueryResult<Vec<String>>, ApiError> {
    self
      .query(keys::chains::codes(), Some(CHAINS_STALE), |api| async move {
        Ok::<_, FetchError>(api.chain_codes().await?.chains)
      })
      .await
  }

  /// Chain by code, matched case-insensitively.
  pub async fn chain(&self, code: &str) -> Result<Chain, ApiError> {
    validate::chain_code(code)?;
    let chains = self.chains().await?;
    chains
      .data
      .iter()
      .find(|chain| chain.code.eq_ignore_ascii_case(code))
      .cloned()
      .ok_or_else(|| ApiError::NotFound(format!("chain {}", code)))
  }

  pub async fn chain_stats(&self, code: &str) -> Result<ChainSummary, ApiError> {
    Ok(ChainSummary::from(&self.chain(code).await?))
  }

  /// Chain code to display name.
  pub async fn chain_map(&self) -> Result<BTreeMap<String, String>, ApiError> {
    let chains = self.chains().await?;
    Ok(
      chains
        .data
        .iter()
        .map(|chain| (chain.code.clone(), chain.name.clone()))
        .collect(),
    )
  }

  pub async fn search_chains(&self, query: &str) -> Result<Vec<Chain>, ApiError> {
    let term = validate::required(query, "query")?.to_lowercase();
    let chains = self.chains().await?;
    Ok(
      chains
        .data
        .iter()
        .filter(|c| c.name.to_lowercase().contains(&term) || c.code.to_lowercase().contains(&term))
        .cloned()
        .collect(),
    )
  }

  pub async fn chains_by_store_count(&self, descending: bool) -> Result<Vec<Chain>, ApiError> {
    let mut chains = self.chains().await?.data.as_ref().clone();
    chains.sort_by_key(|c| c.stores_count);
    if descending {
      chains.reverse();
    }
    Ok(chains)
  }

  pub async fn chains_by_product_count(&self, descending: bool) -> Result<Vec<Chain>, ApiError> {
    let mut chains = self.chains().await?.data.as_ref().clone();
    chains.sort_by_key(|c| c.products_count);
    if descending {
      chains.reverse();
    }
    Ok(chains)
  }

  /// Chains updated within the last `days` days, newest first.
  pub async fn recently_updated_chains(&self, days: u32) -> Result<Vec<Chain>, ApiError> {
    let days = validate::positive(days, "days")?;
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let chains = self.chains().await?;

    let mut recent: Vec<(DateTime<Utc>, Chain)> = chains
      .data
      .iter()
      .filter_map(|chain| {
        let updated = DateTime::parse_from_rfc3339(&chain.last_updated).ok()?;
        Some((updated.with_timezone(&Utc), chain.clone()))
      })
      .filter(|(updated, _)| *updated >= cutoff)
      .collect();
    recent.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(recent.into_iter().map(|(_, chain)| chain).collect())
  }

  // ==========================================================================
  // Archives
  // ==========================================================================

  pub async fn archives(&self) -> Result<QueryResult<ArchiveListResponse>, ApiError> {
    self
      .query(keys::archives::list(), Some(ARCHIVES_STALE), |api| async move {
        api.archives().await
      })
      .await
  }

  pub async fn latest_archive(&self) -> Result<Archive, ApiError> {
    let latest = self
      .query(keys::archives::latest(), Some(LATEST_ARCHIVE_STALE), |api| async move {
        Ok::<_, FetchError>(api.archives().await?.latest().cloned())
      })
      .await?;

    latest
      .data
      .as_ref()
      .clone()
      .ok_or_else(|| ApiError::NotFound("archive".to_string()))
  }

  pub async fn archive(&self, date: &str) -> Result<Archive, ApiError> {
    validate::date(date)?;
    let archives = self.archives().await?;
    archives
      .data
      .archives
      .iter()
      .find(|archive| archive.date == date)
      .cloned()
      .ok_or_else(|| ApiError::NotFound(format!("archive for {}", date)))
  }

  /// Download one daily archive. Not cached; retried as a mutation.
  pub async fn download_archive(&self, date: &str) -> Result<Vec<u8>, ApiError> {
    validate::date(date)?;
    let api = &self.inner;
    let options = &self.cache.defaults().mutations;
    let bytes = self
      .cache
      .mutate(options, || api.download_archive(date))
      .await?;
    Ok(bytes)
  }

  // ==========================================================================

  async fn query<T, F, Fut>(
    &self,
    key: QueryKey,
    stale_time: Option<Duration>,
    fetch: F,
  ) -> Result<QueryResult<T>, ApiError>
  where
    T: Send + Sync + 'static,
    F: Fn(ApiClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let mut options = self.cache.defaults().queries.clone();
    if let Some(stale_time) = stale_time {
      let gc_time = options.gc_time.max(stale_time);
      options = options.with_stale_time(stale_time).with_gc_time(gc_time);
    }

    let api = self.inner.clone();
    let result = self
      .cache
      .get_or_fetch_with(&key, options, move || fetch(api.clone()))
      .await?;
    Ok(result)
  }
}
