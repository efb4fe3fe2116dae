//! Core types for the caching system.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::Response;

/// Identity of a cached request: method plus URL.
///
/// Fragments never reach the network, so they are dropped from the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  method: String,
  url: String,
}

impl CacheKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Only GET requests are ever looked up or stored.
  pub fn is_get(&self) -> bool {
    self.method == Method::GET.as_str()
  }

  /// SHA256 of the identity for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// Namespace the entry was found in
  pub cache_name: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of a strategy run, including the response and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cache hit on a cache-first lookup.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed, serving a cached copy instead.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed, serving the offline fallback document.
  pub fn offline_page(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::OfflinePage,
      cached_at: Some(cached_at),
    }
  }

  /// Produced locally with no cache or network involvement.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }

  /// Went straight to the network without the worker's strategies.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache-first hit
  Cache,
  /// Network unavailable, serving a cached copy
  Offline,
  /// Network unavailable, serving the offline document
  OfflinePage,
  /// Network unavailable and nothing cached
  Synthesized,
  /// Worker not yet in control
  Passthrough,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::OfflinePage => "offline-page",
      Self::Synthesized => "synthesized",
      Self::Passthrough => "passthrough",
    }
  }
}
