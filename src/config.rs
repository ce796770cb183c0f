use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{DEFAULT_PAGE_SIZE, DEFAULT_PREFETCH_DISTANCE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub paging: PagingConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// API root, e.g. https://story-api.dicoding.dev/v1
  #[serde(default = "default_api_url")]
  pub url: String,
  /// Per-request timeout; expiry is reported as a network error
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_api_url() -> String {
  "https://story-api.dicoding.dev/v1".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagingConfig {
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  /// Items from an edge of the cache at which the next page is loaded
  #[serde(default = "default_prefetch_distance")]
  pub prefetch_distance: usize,
}

impl Default for PagingConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      prefetch_distance: default_prefetch_distance(),
    }
  }
}

fn default_page_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

fn default_prefetch_distance() -> usize {
  DEFAULT_PREFETCH_DISTANCE
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Database file (defaults to $XDG_DATA_HOME/storyfeed/cache.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storyfeed.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storyfeed/config.yaml
  ///
  /// Without any file the defaults are used.
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
    // Check current directory
    let local = PathBuf::from("storyfeed.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storyfeed").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.paging.page_size == 0 {
      return Err(eyre!("paging.page_size must be at least 1"));
    }
    Ok(config)
  }

  /// Get the session token from environment variables.
  ///
  /// Checks STORYFEED_TOKEN. Without a token requests are sent anonymously.
  pub fn get_api_token() -> Option<String> {
    std::env::var("STORYFEED_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
