use url::Url;

use crate::cache::CacheNames;

/// Immutable worker configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub names: CacheNames,
  /// Absolute URLs of the shell assets cached at install
  pub precache: Vec<Url>,
  pub offline_page: Url,
  pub api_prefix: String,
  pub pending_tasks: Url,
  pub tasks: Url,
  pub sync_tag: String,
  pub sync_complete_message: String,
  pub skip_waiting: bool,
}

/// Caching strategy applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// API calls: live data preferred, cache as offline fallback
  NetworkFirst,
  /// Static assets: cached copy preferred, never revalidated
  CacheFirst,
}

impl WorkerSettings {
  pub fn strategy_for(&self, url: &Url) -> Strategy {
    if url.path().starts_with(&self.api_prefix) {
      Strategy::NetworkFirst
    } else {
      Strategy::CacheFirst
    }
  }

  /// Everything fetched at install: the shell assets plus the offline page.
  pub fn install_urls(&self) -> Vec<Url> {
    let mut urls = self.precache.clone();
    if !urls.contains(&self.offline_page) {
      urls.push(self.offline_page.clone());
    }
    urls
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
    self.origin.join(path)
  }
}

#[cfg(test)]
mod tests {
  use crate::config::Config;

  use super::*;

  #[test]
  fn test_api_paths_are_network_first() {
    let settings = Config::default().worker_settings().unwrap();
    let url = settings.resolve("/api/tasks/5").unwrap();
    assert_eq!(settings.strategy_for(&url), Strategy::NetworkFirst);
  }

  #[test]
  fn test_other_paths_are_cache_first() {
    let settings = Config::default().worker_settings().unwrap();
    for path in ["/", "/index.html", "/apiary.png", "/static/api/x.js"] {
      let url = settings.resolve(path).unwrap();
      assert_eq!(settings.strategy_for(&url), Strategy::CacheFirst, "{}", path);
    }
  }

  #[test]
  fn test_install_urls_include_offline_page_once() {
    let mut settings = Config::default().worker_settings().unwrap();
    assert_eq!(settings.install_urls().len(), 6);

    settings.precache.push(settings.offline_page.clone());
    assert_eq!(settings.install_urls().len(), 6);
  }
}
