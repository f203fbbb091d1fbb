use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ClientDefaults, MutationOptions, QueryOptions, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://cijene.searxngmate.tk";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub pagination: PaginationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_secs: u64,
  pub gc_secs: u64,
  /// 0 disables periodic refresh
  pub refetch_interval_secs: u64,
  pub refetch_on_focus: bool,
  pub refetch_on_reconnect: bool,
  pub query_retries: u32,
  pub mutation_retries: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_secs: 5 * 60,
      gc_secs: 10 * 60,
      refetch_interval_secs: 5 * 60,
      refetch_on_focus: true,
      refetch_on_reconnect: true,
      query_retries: 3,
      mutation_retries: 2,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
  pub default_per_page: i64,
  pub max_per_page: i64,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self {
      default_per_page: crate::params::DEFAULT_PER_PAGE,
      max_per_page: crate::params::MAX_PER_PAGE,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cijene.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cijene/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cijene.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cijene").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.pagination.max_per_page < 1 {
      return Err(eyre!("pagination.max_per_page must be at least 1"));
    }
    Ok(config)
  }

  /// Get the API token from the environment, if one is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CIJENE_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  /// Cache policy for the query client.
  pub fn client_defaults(&self) -> ClientDefaults {
    let cache = &self.cache;
    let queries = QueryOptions::default()
      .with_stale_time(Duration::from_secs(cache.stale_secs))
      .with_gc_time(Duration::from_secs(cache.gc_secs))
      .with_retry(RetryPolicy::queries().with_max_retries(cache.query_retries))
      .with_refetch_interval(Some(Duration::from_secs(cache.refetch_interval_secs)))
      .with_refetch_on_focus(cache.refetch_on_focus)
      .with_refetch_on_reconnect(cache.refetch_on_reconnect);
    let mutations =
      MutationOptions::new().with_retry(RetryPolicy::mutations().with_max_retries(cache.mutation_retries));

    ClientDefaults { queries, mutations }
  }
}
