//! Query key factory.
//!
//! One module per entity family. Every family has an `all()` root; list,
//! detail and sub-resource keys extend their parent key, so invalidating a
//! parent reaches everything under it:
//!
//! ```ignore
//! client.invalidate(&keys::products::detail("42"));  // detail, prices, comparisons
//! client.invalidate(&keys::products::all());         // every product query
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::QueryKey;

/// Entity families with their own key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  Products,
  Stores,
  Chains,
  Archives,
  User,
}

impl Family {
  pub const ALL: [Family; 5] = [
    Family::Products,
    Family::Stores,
    Family::Chains,
    Family::Archives,
    Family::User,
  ];

  pub fn namespace(self) -> &'static str {
    match self {
      Family::Products => "products",
      Family::Stores => "stores",
      Family::Chains => "chains",
      Family::Archives => "archives",
      Family::User => "user",
    }
  }

  /// The family root key.
  pub fn all(self) -> QueryKey {
    QueryKey::root(self.namespace())
  }
}

impl fmt::Display for Family {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.namespace())
  }
}

/// Generic key constructor: the family root followed by `segments` in order.
pub fn key_for<I, S>(family: Family, segments: I) -> QueryKey
where
  I: IntoIterator<Item = S>,
  S: Into<Value>,
{
  segments
    .into_iter()
    .fold(family.all(), |key, segment| key.child(segment))
}

pub mod products {
  use super::*;

  pub fn all() -> QueryKey {
    Family::Products.all()
  }

  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn list<P: Serialize + fmt::Debug>(filter: &P) -> QueryKey {
    lists().child_params(filter)
  }

  pub fn details() -> QueryKey {
    all().child("detail")
  }

  pub fn detail(id: &str) -> QueryKey {
    details().child(id)
  }

  pub fn prices(id: &str) -> QueryKey {
    detail(id).child("prices")
  }

  /// Price comparison for one product, keyed by its price filter.
  pub fn price_comparison<P: Serialize + fmt::Debug>(id: &str, filter: &P) -> QueryKey {
    prices(id).child_params(filter)
  }

  pub fn suggestions(query: &str) -> QueryKey {
    all().child("suggestions").child(query)
  }

  pub fn popular(limit: u32) -> QueryKey {
    all().child("popular").child(limit)
  }

  pub fn by_ean(ean: &str) -> QueryKey {
    all().child("ean").child(ean)
  }

  pub fn by_chain_code(code: &str) -> QueryKey {
    all().child("chain").child(code)
  }
}

pub mod stores {
  use super::*;

  pub fn all() -> QueryKey {
    Family::Stores.all()
  }

  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn list<P: Serialize + fmt::Debug>(filter: &P) -> QueryKey {
    lists().child_params(filter)
  }

  pub fn details() -> QueryKey {
    all().child("detail")
  }

  pub fn detail(id: &str) -> QueryKey {
    details().child(id)
  }

  pub fn nearby(latitude: f64, longitude: f64, radius_km: f64, chains: &[String]) -> QueryKey {
    all().child("nearby").child(json!({
      "latitude": latitude,
      "longitude": longitude,
      "radius": radius_km,
      "chains": chains,
    }))
  }

  pub fn by_city(city: &str, chains: &[String]) -> QueryKey {
    all().child("city").child(json!({ "city": city, "chains": chains }))
  }

  pub fn by_chain(code: &str) -> QueryKey {
    all().child("chain").child(code)
  }

  pub fn suggestions(query: &str) -> QueryKey {
    all().child("suggestions").child(query)
  }
}

pub mod chains {
  use super::*;

  pub fn all() -> QueryKey {
    Family::Chains.all()
  }

  pub fn lists() -> QueryKey {
    all().child("list")
  }

  pub fn details() -> QueryKey {
    all().child("detail")
  }

  pub fn detail(code: &str) -> QueryKey {
    details().child(code)
  }

  pub fn stats(code: &str) -> QueryKey {
    detail(code).child("stats")
  }

  pub fn codes() -> QueryKey {
    all().child("codes")
  }

  pub fn map() -> QueryKey {
    all().child("map")
  }

  pub fn search(query: &str) -> QueryKey {
    all().child("search").child(query)
  }

  pub fn by_store_count() -> QueryKey {
    all().child("by-store-count")
  }

  pub fn by_product_count() -> QueryKey {
    all().child("by-product-count")
  }

  pub fn recently_updated(days: u32) -> QueryKey {
    all().child("recently-updated").child(days)
  }
}

pub mod archives {
  use super::*;

  pub fn all() -> QueryKey {
    Family::Archives.all()
  }

  pub fn list() -> QueryKey {
    all().child("list")
  }

  pub fn detail(date: &str) -> QueryKey {
    all().child("detail").child(date)
  }

  pub fn metadata(date: &str) -> QueryKey {
    detail(date).child("metadata")
  }

  pub fn dates() -> QueryKey {
    all().child("dates")
  }

  pub fn latest() -> QueryKey {
    all().child("latest")
  }
}

pub mod user {
  use super::*;

  pub fn all() -> QueryKey {
    Family::User.all()
  }

  pub fn profile() -> QueryKey {
    all().child("profile")
  }

  pub fn preferences() -> QueryKey {
    all().child("preferences")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[derive(Debug, Serialize)]
  struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    chains: Vec<String>,
  }

  fn filter(query: &str, chains: &[&str]) -> Filter {
    Filter {
      query: Some(query.to_string()),
      chains: chains.iter().map(|c| c.to_string()).collect(),
    }
  }

  #[test]
  fn test_identical_arguments_give_identical_keys() {
    assert_eq!(
      products::list(&filter("mlijeko", &["konzum"])),
      products::list(&filter("mlijeko", &["konzum"]))
    );
    assert_eq!(products::prices("42"), products::prices("42"));
    assert_eq!(
      stores::nearby(45.8, 15.97, 5.0, &[]),
      stores::nearby(45.8, 15.97, 5.0, &[])
    );
    // On the equator or the prime meridian
    assert_eq!(
      stores::nearby(-0.0, -0.0, 5.0, &[]).fingerprint(),
      stores::nearby(0.0, 0.0, 5.0, &[]).fingerprint()
    );
  }

  #[test]
  fn test_differing_arguments_give_distinct_keys() {
    let keys = vec![
      products::all(),
      products::lists(),
      products::list(&filter("mlijeko", &[])),
      products::list(&filter("kruh", &[])),
      products::list(&filter("kruh", &["lidl"])),
      products::details(),
      products::detail("1"),
      products::detail("2"),
      products::prices("1"),
      products::price_comparison("1", &filter("", &["lidl"])),
      products::suggestions("kr"),
      products::popular(10),
      products::popular(20),
      products::by_ean("3850108012340"),
      products::by_chain_code("lidl"),
      stores::all(),
      stores::list(&filter("zagreb", &[])),
      stores::detail("1"),
      stores::nearby(45.8, 15.97, 5.0, &[]),
      stores::nearby(45.8, 15.97, 10.0, &[]),
      stores::nearby(45.8, 15.97, 5.0, &["konzum".to_string()]),
      stores::by_city("Zagreb", &[]),
      stores::by_city("Zagreb", &["spar".to_string()]),
      stores::by_chain("lidl"),
      stores::suggestions("kr"),
      chains::all(),
      chains::lists(),
      chains::detail("lidl"),
      chains::stats("lidl"),
      chains::codes(),
      chains::map(),
      chains::search("li"),
      chains::by_store_count(),
      chains::by_product_count(),
      chains::recently_updated(7),
      chains::recently_updated(30),
      archives::all(),
      archives::list(),
      archives::detail("2025-01-01"),
      archives::metadata("2025-01-01"),
      archives::dates(),
      archives::latest(),
      user::all(),
      user::profile(),
      user::preferences(),
    ];

    let unique: HashSet<String> = keys.iter().map(QueryKey::fingerprint).collect();
    assert_eq!(unique.len(), keys.len());
  }

  #[test]
  fn test_sub_resources_extend_parent_by_one_segment() {
    let detail = products::detail("42");
    assert_eq!(products::prices("42").len(), detail.len() + 1);
    assert!(products::prices("42").is_descendant_of(&detail));
    assert!(detail.is_descendant_of(&products::details()));
    assert!(products::details().is_descendant_of(&products::all()));

    let comparison = products::price_comparison("42", &filter("", &[]));
    assert!(comparison.is_descendant_of(&products::prices("42")));

    assert!(chains::stats("lidl").is_descendant_of(&chains::detail("lidl")));
    assert!(archives::metadata("2025-01-01").is_descendant_of(&archives::detail("2025-01-01")));
  }

  #[test]
  fn test_families_do_not_overlap() {
    for family in Family::ALL {
      for other in Family::ALL {
        if family != other {
          assert!(!family.all().starts_with(&other.all()));
        }
      }
    }
    assert!(!stores::by_chain("lidl").starts_with(&products::all()));
  }

  #[test]
  fn test_key_for_matches_family_helpers() {
    assert_eq!(key_for(Family::Products, ["detail", "42"]), products::detail("42"));
    assert_eq!(key_for(Family::User, ["profile"]), user::profile());
    assert_eq!(key_for(Family::Chains, Vec::<Value>::new()), chains::all());
    assert_eq!(Family::Archives.to_string(), "archives");
  }
}
