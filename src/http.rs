//! Request and response types shared by the network seam and the caches.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::cache::CacheKey;

/// An outgoing request as seen by the fetch interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Build a POST carrying a JSON body.
  pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self> {
    let body = serde_json::to_vec(payload).map_err(|e| eyre!("Failed to encode body: {}", e))?;
    Ok(
      Self::new(Method::POST, url)
        .with_header("content-type", "application/json")
        .with_body(body),
    )
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// Whether the caller is willing to receive an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::new(&self.method, &self.url)
  }
}

/// How a response relates to the origin that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response
  Cors,
  /// Produced locally, never touched the network
  Synthetic,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Synthetic => "synthetic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "synthetic" => Some(Self::Synthetic),
      _ => None,
    }
  }
}

/// A response, either live from the network or replayed from a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub kind: ResponseKind,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, kind: ResponseKind, body: Vec<u8>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      kind,
      headers: BTreeMap::new(),
      body,
    }
  }

  /// Build a locally produced JSON response.
  pub fn json(status: u16, value: &serde_json::Value) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to encode JSON response: {}", e))?;
    Ok(
      Self::new(status, ResponseKind::Synthetic, body)
        .with_header("content-type", "application/json"),
    )
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Status in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  #[cfg(test)]
  pub fn json_body(&self) -> Result<serde_json::Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }
}

fn reason_phrase(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
