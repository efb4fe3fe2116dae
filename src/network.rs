//! Network seam used by the worker for every outgoing request.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;
use url::{Origin, Url};

use crate::http::{Request, Response, ResponseKind};

/// Something that can carry a request to the network.
///
/// Implementations return `Err` only for transport failures (no connectivity,
/// DNS or TLS errors). Any HTTP status, success or not, is an `Ok` response.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP network client wrapper
#[derive(Clone)]
pub struct ReqwestNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl ReqwestNetwork {
  pub fn new(origin: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("edition-worker/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }

  fn kind_for(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.origin {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

impl Network for ReqwestNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }
    let kind = self.kind_for(&request.url);
    let url = request.url.clone();

    async move {
      let resp = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

      let status = resp.status();
      let headers: BTreeMap<String, String> = resp
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = resp
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

      Ok(Response {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
        kind,
        headers,
        body: body.to_vec(),
      })
    }
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted in-process network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Serves canned responses by method and path, and records every request.
  #[derive(Default)]
  pub struct FakeNetwork {
    routes: Mutex<HashMap<(String, String), Response>>,
    failing: Mutex<Vec<String>>,
    offline: AtomicBool,
    requests: Mutex<Vec<Request>>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn route(&self, method: &str, path: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert((method.to_string(), path.to_string()), response);
    }

    pub fn serve(&self, path: &str, body: &str) {
      self.route(
        "GET",
        path,
        Response::new(200, ResponseKind::Basic, body.as_bytes().to_vec()),
      );
    }

    /// Make every request to this path fail at the transport level.
    pub fn fail_path(&self, path: &str) {
      self.failing.lock().unwrap().push(path.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Request> {
      self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
      self
        .requests()
        .iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .count()
    }
  }

  impl Network for FakeNetwork {
    fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
      self.requests.lock().unwrap().push(request.clone());

      let path = request.url.path().to_string();
      let result = if self.offline.load(Ordering::SeqCst)
        || self.failing.lock().unwrap().contains(&path)
      {
        Err(eyre!("network unreachable: {}", request.url))
      } else {
        Ok(
          self
            .routes
            .lock()
            .unwrap()
            .get(&(request.method.as_str().to_string(), path))
            .cloned()
            .unwrap_or_else(|| Response::new(404, ResponseKind::Basic, Vec::new())),
        )
      };

      async move {
        tokio::task::yield_now().await;
        result
      }
    }
  }
}
