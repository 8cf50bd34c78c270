use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::conflict::ConflictPolicy;
use crate::queue::RetryPolicy;
use crate::store::{SqliteStore, StoreQuota};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub intercept: InterceptConfig,
  /// Per-store limits and API conventions, keyed by store name
  #[serde(default)]
  pub stores: BTreeMap<String, StoreConfig>,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Origin every intercepted path is resolved against
  pub base_url: String,
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
  /// Navigations give up on the network sooner and fall back to cache
  #[serde(default = "default_navigation_timeout_ms")]
  pub navigation_timeout_ms: u64,
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

fn default_navigation_timeout_ms() -> u64 {
  3_000
}

fn default_health_path() -> String {
  "/health".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  pub api_prefix: String,
  pub static_prefixes: Vec<String>,
  pub navigation_routes: Vec<String>,
  /// Cached page served when a navigation cannot be answered
  pub offline_fallback: Option<String>,
  /// TTL for read API entries in stores without their own; 0 disables expiry
  pub read_ttl_secs: u64,
  /// Routes fetched into the cache by the `precache` command
  pub precache: Vec<String>,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api".to_string(),
      static_prefixes: vec!["/static/".to_string()],
      navigation_routes: vec!["/".to_string()],
      offline_fallback: None,
      read_ttl_secs: 300,
      precache: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub max_entries: Option<usize>,
  pub max_bytes: Option<u64>,
  pub ttl_secs: Option<u64>,
  /// Payload field holding the entity id (default `id`)
  pub key_field: Option<String>,
  /// Response field holding the server's last-modified time (default `updated_at`)
  pub version_field: Option<String>,
  pub conflict: ConflictPolicy,
}

impl StoreConfig {
  pub fn quota(&self) -> Option<StoreQuota> {
    if self.max_entries.is_none() && self.max_bytes.is_none() {
      return None;
    }
    Some(StoreQuota {
      max_entries: self.max_entries,
      max_bytes: self.max_bytes,
    })
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_attempts: u32,
  /// How long a claimed item belongs to its worker before others may reclaim it
  pub lease_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: 2_000,
      max_delay_ms: 300_000,
      max_attempts: 5,
      lease_secs: 60,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      base_delay: chrono::Duration::milliseconds(self.base_delay_ms as i64),
      max_delay: chrono::Duration::milliseconds(self.max_delay_ms as i64),
      max_attempts: self.max_attempts.max(1),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Network calls allowed at once while draining
  pub concurrency: usize,
  pub probe_interval_secs: u64,
  pub bus_capacity: usize,
  /// Sync tag → stores it drains
  pub tags: BTreeMap<String, Vec<String>>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      concurrency: 3,
      probe_interval_secs: 15,
      bus_capacity: 256,
      tags: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  /// Database file: the configured path, else under the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path().ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./lxp-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lxp-sync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/lxp-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lxp-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lxp-sync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.server.base_url.trim().is_empty() {
      return Err(eyre!("server.base_url must not be empty"));
    }
    Ok(config)
  }

  /// Get the bearer token for the platform API from `LXP_SYNC_TOKEN`, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LXP_SYNC_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
