//! Fetch interception: picks a strategy per request and degrades when offline.

use color_eyre::Result;
use reqwest::Method;
use tracing::{debug, warn};

use super::settings::Strategy;
use super::{ServiceWorker, WorkerState};
use crate::cache::{CacheEntry, CacheKey, CacheResult, CacheStorage};
use crate::http::{Request, Response};
use crate::network::Network;

/// Status of the synthesized offline API response
const OFFLINE_STATUS: u16 = 503;

/// Body returned for an API request that can be served neither live nor from cache.
pub fn offline_api_response() -> Result<Response> {
  Response::json(
    OFFLINE_STATUS,
    &serde_json::json!({
      "error": "offline",
      "message": "Network unavailable and no cached response for this request",
      "offline": true,
    }),
  )
}

impl<N: Network, S: CacheStorage> ServiceWorker<N, S> {
  pub(super) async fn on_fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    if self.state()? != WorkerState::Activated {
      // Nothing controls the page yet
      let response = self.inner.network.fetch(&request).await?;
      return Ok(CacheResult::passthrough(response));
    }

    let key = request.cache_key();
    match self.inner.settings.strategy_for(&request.url) {
      Strategy::NetworkFirst => self.fetch_api(&request, &key).await,
      Strategy::CacheFirst => self.fetch_static(&request, &key).await,
    }
  }

  /// Network-first; never fails, falling back to a synthesized offline body.
  async fn fetch_api(&self, request: &Request, key: &CacheKey) -> Result<CacheResult<Response>> {
    let result = self
      .inner
      .cache
      .network_first(key, || self.inner.network.fetch(request))
      .await;

    match result {
      Ok(result) => Ok(result),
      Err(e) => {
        warn!(url = %request.url, method = %request.method, "API unavailable offline: {}", e);
        Ok(CacheResult::synthesized(offline_api_response()?))
      }
    }
  }

  /// Cache-first; HTML requests fall back to the offline page, others propagate.
  async fn fetch_static(
    &self,
    request: &Request,
    key: &CacheKey,
  ) -> Result<CacheResult<Response>> {
    let result = self
      .inner
      .cache
      .cache_first(key, || self.inner.network.fetch(request))
      .await;

    match result {
      Ok(result) => Ok(result),
      Err(e) if request.accepts_html() => match self.offline_page()? {
        Some(page) => {
          debug!(url = %request.url, cache = %page.cache_name, "Serving offline page: {}", e);
          Ok(CacheResult::offline_page(page.response, page.cached_at))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  /// The offline document, as precached into this version's static cache.
  fn offline_page(&self) -> Result<Option<CacheEntry>> {
    let key = CacheKey::new(&Method::GET, &self.inner.settings.offline_page);
    let cache = self.inner.cache.names().static_name.as_str();
    self.inner.cache.storage().match_in(cache, &key)
  }
}
