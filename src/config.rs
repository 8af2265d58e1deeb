use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::UpdateMethod;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub retry: RetryConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub resource: ResourceConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL; endpoints live under `<url>/api/`
  pub url: String,
  /// Path probed by the health check, relative to `<url>/api/`
  pub probe_path: String,
  /// Verb used for updates: put or patch
  pub update_method: UpdateMethod,
  pub read_timeout_secs: u64,
  pub probe_timeout_secs: u64,
  /// Timeout for reloads done by the auto-sync loop
  pub background_timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://127.0.0.1:8001".to_string(),
      probe_path: "users/".to_string(),
      update_method: UpdateMethod::Put,
      read_timeout_secs: 10,
      probe_timeout_secs: 5,
      background_timeout_secs: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub backoff_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { ttl_secs: 300 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Auto-sync interval used by `watch`
  pub interval_secs: u64,
  /// Drop queued operations the backend refuses with a 4xx instead of
  /// keeping them queued
  pub discard_rejected: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      discard_rejected: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
  pub name: String,
  pub search_field: String,
  /// JSON array of records shown when nothing else is available
  pub default_dataset: Option<PathBuf>,
}

impl Default for ResourceConfig {
  fn default() -> Self {
    Self {
      name: "barang".to_string(),
      search_field: "nama".to_string(),
      default_dataset: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/invsync/store.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./invsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/invsync/config.yaml
  ///
  /// Without a file, defaults are used. Environment overrides are applied
  /// last.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("INVSYNC_BACKEND_URL") {
      config.backend.url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("invsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("invsync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the bearer token for the backend, if one is set.
  ///
  /// Checks INVSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("INVSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
