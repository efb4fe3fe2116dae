use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CacheNames;
use crate::worker::WorkerSettings;

/// Environment variable overriding `origin`
const ORIGIN_ENV: &str = "EDITION_WORKER_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin serving both the app shell and the REST API
  pub origin: String,
  pub cache: CacheConfig,
  pub assets: AssetsConfig,
  pub api: ApiConfig,
  pub sync: SyncConfig,
  pub lifecycle: LifecycleConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      assets: AssetsConfig::default(),
      api: ApiConfig::default(),
      sync: SyncConfig::default(),
      lifecycle: LifecycleConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bumping this is the only way to invalidate a previous generation
  pub version: String,
  pub prefix: String,
  /// SQLite file holding the caches (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      prefix: "edition".to_string(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
  /// Shell paths written to the static cache at install
  pub precache: Vec<String>,
  /// Document served to HTML requests when offline
  pub offline_page: String,
}

impl Default for AssetsConfig {
  fn default() -> Self {
    Self {
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192x192.png".to_string(),
        "/icons/icon-512x512.png".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Paths starting with this prefix are served network-first
  pub prefix: String,
  pub pending_tasks: String,
  pub tasks: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      prefix: "/api/".to_string(),
      pending_tasks: "/api/tasks/pending".to_string(),
      tasks: "/api/tasks".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub tag: String,
  pub complete_message: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-tasks".to_string(),
      complete_message: "Tasks synced successfully".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate right after install instead of waiting for a skipWaiting message
  pub skip_waiting: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { skip_waiting: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter used when RUST_LOG is not set
  pub level: String,
  /// Daily-rotated log file, in addition to stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edition-worker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edition-worker/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The
  /// EDITION_WORKER_ORIGIN environment variable overrides `origin`.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("edition-worker.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edition-worker").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn with_env_overrides(self) -> Self {
    match std::env::var(ORIGIN_ENV) {
      Ok(origin) if !origin.trim().is_empty() => Config { origin, ..self },
      _ => self,
    }
  }

  /// Resolve into the immutable settings the worker runs with.
  pub fn worker_settings(&self) -> Result<WorkerSettings> {
    let origin = url::Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    if !self.api.prefix.starts_with('/') {
      return Err(eyre!("api.prefix must start with '/': {}", self.api.prefix));
    }

    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
    };

    Ok(WorkerSettings {
      names: CacheNames::new(&self.cache.prefix, &self.cache.version),
      precache: self
        .assets
        .precache
        .iter()
        .map(|p| resolve(p.as_str()))
        .collect::<Result<Vec<_>>>()?,
      offline_page: resolve(self.assets.offline_page.as_str())?,
      api_prefix: self.api.prefix.clone(),
      pending_tasks: resolve(self.api.pending_tasks.as_str())?,
      tasks: resolve(self.api.tasks.as_str())?,
      sync_tag: self.sync.tag.clone(),
      sync_complete_message: self.sync.complete_message.clone(),
      skip_waiting: self.lifecycle.skip_waiting,
      origin,
    })
  }

  /// Database path from config, or the default under the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }
}
