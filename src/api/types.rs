//! Serde types matching the price API, plus the request filters we build.
//!
//! Response types use `#[serde(default)]` generously: the API omits fields
//! rather than sending nulls.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::params::ParamsBuilder;

// ============================================================================
// Products
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub brand: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quantity: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ean: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chain_code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chain: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSearchResponse {
  #[serde(default)]
  pub products: Vec<Product>,
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub page: u64,
  #[serde(default)]
  pub per_page: u64,
}

impl ProductSearchResponse {
  pub fn single(product: Product) -> Self {
    Self {
      products: vec![product],
      total_count: 1,
      page: 1,
      per_page: 1,
    }
  }

  pub fn empty() -> Self {
    Self {
      page: 1,
      ..Self::default()
    }
  }
}

// ============================================================================
// Stores
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub address: String,
  #[serde(default)]
  pub city: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(default)]
  pub chain: String,
  #[serde(default)]
  pub chain_code: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub store_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub latitude: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub longitude: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub distance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSearchResponse {
  #[serde(default)]
  pub stores: Vec<Store>,
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub page: u64,
  #[serde(default)]
  pub per_page: u64,
}

// ============================================================================
// Chains
// ============================================================================

/// `/v1/chains/` only lists codes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainCodesResponse {
  #[serde(default)]
  pub chains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStats {
  pub chain_code: String,
  #[serde(default)]
  pub price_date: String,
  #[serde(default)]
  pub price_count: u64,
  #[serde(default)]
  pub store_count: u64,
  #[serde(default)]
  pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainStatsResponse {
  #[serde(default)]
  pub chain_stats: Vec<ChainStats>,
}

/// A chain code enriched with its statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
  pub code: String,
  pub name: String,
  pub stores_count: u64,
  pub products_count: u64,
  pub last_updated: String,
}

impl Chain {
  /// Build a chain from its code and (possibly missing) stats.
  ///
  /// A chain without stats reports zero counts and `fallback_updated`.
  pub fn from_parts(code: &str, stats: Option<&ChainStats>, fallback_updated: &str) -> Self {
    Self {
      code: code.to_string(),
      name: display_name(code),
      stores_count: stats.map_or(0, |s| s.store_count),
      products_count: stats.map_or(0, |s| s.price_count),
      last_updated: stats
        .map(|s| s.created_at.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback_updated.to_string()),
    }
  }
}

/// `KONZUM` → `Konzum`
pub fn display_name(code: &str) -> String {
  let mut chars = code.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
    None => String::new(),
  }
}

/// Per-chain statistics as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
  pub stores_count: u64,
  pub products_count: u64,
  pub last_updated: String,
}

impl From<&Chain> for ChainSummary {
  fn from(chain: &Chain) -> Self {
    Self {
      stores_count: chain.stores_count,
      products_count: chain.products_count,
      last_updated: chain.last_updated.clone(),
    }
  }
}

// ============================================================================
// Archives
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
  pub date: String,
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub size: u64,
  #[serde(default)]
  pub updated: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveListResponse {
  #[serde(default)]
  pub archives: Vec<Archive>,
}

impl ArchiveListResponse {
  /// The archive with the most recent date. Dates are `YYYY-MM-DD`, so
  /// lexicographic order is chronological.
  pub fn latest(&self) -> Option<&Archive> {
    self.archives.iter().max_by(|a, b| a.date.cmp(&b.date))
  }
}

// ============================================================================
// Prices
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStore {
  pub chain_id: u64,
  pub code: String,
  #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
  pub store_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zipcode: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lat: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lon: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
}

/// One store's price for one product. Prices are decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorePrice {
  pub chain: String,
  pub ean: String,
  #[serde(default)]
  pub price_date: String,
  #[serde(default)]
  pub regular_price: Option<String>,
  #[serde(default)]
  pub special_price: Option<String>,
  #[serde(default)]
  pub unit_price: Option<String>,
  #[serde(default)]
  pub best_price_30: Option<String>,
  #[serde(default)]
  pub anchor_price: Option<String>,
  pub store: ApiStore,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorePricesResponse {
  #[serde(default)]
  pub store_prices: Vec<StorePrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
  pub product_id: String,
  pub store_id: String,
  pub chain: String,
  pub price: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub special_price: Option<f64>,
  pub currency: String,
  pub date: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub unit_price: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub store_address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub store_city: Option<String>,
}

impl Price {
  /// The price a shopper actually pays: the special price when there is one.
  pub fn effective(&self) -> f64 {
    self.special_price.unwrap_or(self.price)
  }
}

impl From<StorePrice> for Price {
  fn from(sp: StorePrice) -> Self {
    Self {
      product_id: sp.ean,
      store_id: sp.store.code,
      chain: sp.chain,
      price: parse_price(sp.regular_price.as_deref()).unwrap_or(0.0),
      special_price: parse_price(sp.special_price.as_deref()),
      currency: "EUR".to_string(),
      date: sp.price_date,
      unit_price: parse_price(sp.unit_price.as_deref()),
      store_address: sp.store.address,
      store_city: sp.store.city,
    }
  }
}

fn parse_price(raw: Option<&str>) -> Option<f64> {
  raw
    .and_then(|s| s.trim().parse::<f64>().ok())
    .filter(|p| p.is_finite())
}

/// All known prices for one product with summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceComparison {
  pub product: Product,
  pub prices: Vec<Price>,
  pub min_price: f64,
  pub max_price: f64,
  pub avg_price: f64,
  /// Chains in first-seen order
  pub chains: Vec<String>,
}

impl PriceComparison {
  /// Statistics are taken over positive effective prices; all zero if none.
  pub fn new(product: Product, store_prices: Vec<StorePrice>) -> Self {
    let prices: Vec<Price> = store_prices.into_iter().map(Price::from).collect();

    let valid: Vec<f64> = prices.iter().map(Price::effective).filter(|p| *p > 0.0).collect();
    let (min_price, max_price, avg_price) = if valid.is_empty() {
      (0.0, 0.0, 0.0)
    } else {
      let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
      let max = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
      let avg = valid.iter().sum::<f64>() / valid.len() as f64;
      (min, max, avg)
    };

    let mut seen = BTreeSet::new();
    let chains = prices
      .iter()
      .filter(|p| seen.insert(p.chain.clone()))
      .map(|p| p.chain.clone())
      .collect();

    Self {
      product,
      prices,
      min_price,
      max_price,
      avg_price,
      chains,
    }
  }
}

// ============================================================================
// Requests
// ============================================================================

/// Product search filter. Also used as the list cache key, so it only holds
/// fields that change the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductSearchRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ean: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chain_code: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub chains: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub per_page: Option<i64>,
}

impl ProductSearchRequest {
  pub fn query(query: impl Into<String>) -> Self {
    Self {
      query: Some(query.into()),
      ..Self::default()
    }
  }

  /// Query parameters for `/v1/products/`.
  ///
  /// `query` wins over `ean` for `q`; `chain_code` is folded into `chains`.
  pub fn to_params(&self, max_per_page: i64) -> ParamsBuilder {
    let mut params = ParamsBuilder::new();

    let q = self
      .query
      .as_deref()
      .map(str::trim)
      .filter(|q| !q.is_empty())
      .or(self.ean.as_deref());
    params.add("q", q);

    let chains = self.chains.iter().map(String::as_str).chain(self.chain_code.as_deref());
    params
      .add_array("chains", chains)
      .add("date", self.date.as_deref())
      .add_pagination(self.page, self.per_page, max_per_page);
    params
  }
}

/// Store search filter. `radius` is in meters; the API takes kilometers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSearchRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub chain_codes: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub latitude: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub longitude: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub radius: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub per_page: Option<i64>,
}

impl StoreSearchRequest {
  /// Query parameters for `/v1/stores/`.
  pub fn to_params(&self, max_per_page: i64) -> ParamsBuilder {
    let mut params = ParamsBuilder::new();
    params
      .add("address", self.query.as_deref().map(str::trim))
      .add("city", self.city.as_deref().map(str::trim));
    if !self.chain_codes.is_empty() {
      params.add("chains", self.chain_codes.join(","));
    }
    if let (Some(lat), Some(lon)) = (self.latitude, self.longitude) {
      params.add("lat", lat).add("lon", lon);
    }
    params
      .add("d", self.radius.map(|meters| meters / 1000.0))
      .add_pagination(self.page, self.per_page, max_per_page);
    params
  }
}

/// Price lookup filter for `/v1/prices/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceRequest {
  pub eans: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub chains: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lat: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub lon: Option<f64>,
  /// Search distance in kilometers
  #[serde(skip_serializing_if = "Option::is_none")]
  pub d: Option<f64>,
}

impl PriceRequest {
  pub fn for_ean(ean: impl Into<String>) -> Self {
    Self {
      eans: ean.into(),
      ..Self::default()
    }
  }

  pub fn to_params(&self) -> ParamsBuilder {
    let mut params = ParamsBuilder::new();
    params.add("eans", self.eans.as_str());
    if !self.chains.is_empty() {
      params.add("chains", self.chains.join(","));
    }
    params
      .add("city", self.city.as_deref())
      .add("address", self.address.as_deref())
      .add("lat", self.lat)
      .add("lon", self.lon)
      .add("d", self.d);
    params
  }
}
