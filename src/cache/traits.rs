//! Core traits and types for the generational request cache.

use color_eyre::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::Request;

/// Identity of a cacheable request: method plus absolute URL.
///
/// Only GET requests can become keys, so a key cannot be built for anything
/// the cache must never see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  url: Url,
}

impl CacheKey {
  /// Build the key for a request, or `None` for non-GET requests.
  pub fn for_request(request: &Request) -> Option<Self> {
    if request.method != Method::GET {
      return None;
    }
    Some(Self::get(request.url.clone()))
  }

  /// Key for a GET of the given URL.
  pub fn get(url: Url) -> Self {
    Self { url }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable fixed-length hash used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Snapshot of a response: everything needed to replay it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Summary of one generation for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
  pub name: String,
  pub entries: usize,
}

/// Trait for durable generational cache backends.
///
/// A generation is created implicitly by the first write into it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Names of all generations, in creation order.
  fn generation_names(&self) -> Result<Vec<String>>;

  /// Names and entry counts of all generations, in creation order.
  fn generations(&self) -> Result<Vec<GenerationInfo>>;

  /// Delete a generation and its entries. Returns false if it did not exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Store one entry, creating the generation if needed.
  fn put(&self, generation: &str, key: &CacheKey, response: &ResponseSnapshot) -> Result<()>;

  /// Store all entries in a single atomic write: either every entry lands
  /// or the store is left untouched.
  fn put_all(&self, generation: &str, entries: &[(CacheKey, ResponseSnapshot)]) -> Result<()>;

  /// Look up an entry in one generation.
  fn match_in(&self, generation: &str, key: &CacheKey) -> Result<Option<ResponseSnapshot>>;

  /// Look up an entry across all generations, oldest generation first.
  fn match_any(&self, key: &CacheKey) -> Result<Option<ResponseSnapshot>>;
}
