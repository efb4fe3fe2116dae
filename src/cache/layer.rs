//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::types::{CacheEntry, CacheKey, CacheResult};
use crate::http::{Response, ResponseKind};

/// Names of the two caches owned by one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  /// Pre-listed shell assets, written once at install
  pub static_name: String,
  /// Resources discovered at runtime
  pub dynamic_name: String,
}

impl CacheNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      static_name: format!("{}-static-{}", prefix, version),
      dynamic_name: format!("{}-dynamic-{}", prefix, version),
    }
  }

  /// Whether a cache belongs to this version.
  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }
}

/// Cache layer that manages caching strategies and network fetching.
///
/// This layer sits between the fetch interceptor and the network,
/// providing transparent caching with offline support.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  names: CacheNames,
  /// Dynamic cache writes still in flight
  pending: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over a shared storage backend.
  pub fn new(storage: Arc<S>, names: CacheNames) -> Self {
    Self {
      storage,
      names,
      pending: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Look a request up across all caches. Non-GET requests never match.
  pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    if !key.is_get() {
      return Ok(None);
    }
    self.storage.match_any(key)
  }

  /// Persist a response into the dynamic cache without blocking the caller.
  ///
  /// The write is tracked until [`CacheLayer::flush`] sees it finish. Failures
  /// are logged; the response has already been handed back by then.
  pub fn store_in_background(&self, key: CacheKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.names.dynamic_name.clone();

    let mut pending = self.pending();
    // Reap writes that already landed
    while pending.try_join_next().is_some() {}

    pending.spawn_blocking(move || match storage.put(&cache_name, &key, &response) {
      Ok(()) => debug!(url = key.url(), cache = %cache_name, "Cached response"),
      Err(e) => warn!(url = key.url(), cache = %cache_name, "Failed to cache response: {}", e),
    });
  }

  fn pending(&self) -> MutexGuard<'_, JoinSet<()>> {
    // A panicking write leaves the set itself intact
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Wait for every background write started so far, including writes
  /// started while waiting. Returns how many finished.
  pub async fn flush(&self) -> usize {
    let mut flushed = 0;
    loop {
      let mut writes = {
        let mut pending = self.pending();
        std::mem::take(&mut *pending)
      };
      if writes.is_empty() {
        return flushed;
      }
      while let Some(joined) = writes.join_next().await {
        if let Err(e) = joined {
          warn!("Background cache write did not finish: {}", e);
        }
        flushed += 1;
      }
    }
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Try the network - a 200 GET is copied into the dynamic cache
  /// 2. On network failure, return a cached copy if one exists
  /// 3. Otherwise surface the network error
  pub async fn network_first<F, Fut>(
    &self,
    key: &CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.status == 200 && key.is_get() {
          self.store_in_background(key.clone(), response.clone());
        }
        Ok(CacheResult::from_network(response))
      }
      Err(network_err) => {
        debug!(url = key.url(), "Network failed, trying cache: {}", network_err);
        match self.lookup(key)? {
          Some(cached) => {
            debug!(url = key.url(), cache = %cached.cache_name, "Serving cached copy");
            Ok(CacheResult::offline(cached.response, cached.cached_at))
          }
          None => Err(network_err),
        }
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - a hit is returned as is, never revalidated
  /// 2. On miss, fetch from network
  /// 3. A 200 same-origin GET response is copied into the dynamic cache
  pub async fn cache_first<F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(cached) = self.lookup(key)? {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    if response.status == 200 && response.kind == ResponseKind::Basic && key.is_get() {
      self.store_in_background(key.clone(), response.clone());
    }
    Ok(CacheResult::from_network(response))
  }

  /// Write the full static asset set in one go.
  pub fn precache(&self, entries: &[(CacheKey, Response)]) -> Result<()> {
    self.storage.put_all(&self.names.static_name, entries)
  }

  /// Whether this version's static cache has been populated before.
  pub fn is_precached(&self) -> Result<bool> {
    self.storage.has(&self.names.static_name)
  }

  /// Delete every cache not owned by this version. Returns the names removed.
  pub fn prune(&self) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.storage.keys()? {
      if self.names.is_current(&name) {
        continue;
      }
      if self.storage.delete(&name)? {
        debug!(cache = %name, "Deleted stale cache");
        removed.push(name);
      }
    }
    Ok(removed)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
      pending: Arc::clone(&self.pending),
    }
  }
}
