//! Network boundary: requests, the fetch trait, and the reqwest client.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::cache::ResponseSnapshot;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page navigation (eligible for the offline shell)
  Navigate,
  /// Any subresource fetch
  Subresource,
}

/// A resource request issued by the page.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::Subresource,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// Transport-level fetch failure. HTTP error statuses are not failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request to {0} timed out")]
  Timeout(Url),
}

/// Anything that can perform a resource fetch.
pub trait Network: Send + Sync + 'static {
  fn fetch(
    &self,
    request: &Request,
  ) -> impl Future<Output = Result<ResponseSnapshot, NetworkError>> + Send;
}

/// Network access through reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  /// Build a client. `timeout` bounds each fetch when set; unbounded otherwise.
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    let classify = |e: reqwest::Error| {
      if e.is_timeout() {
        NetworkError::Timeout(request.url.clone())
      } else {
        NetworkError::Unreachable(e.to_string())
      }
    };

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(classify)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(classify)?.to_vec();

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}
