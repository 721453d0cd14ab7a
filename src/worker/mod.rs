//! Background asset cache worker.
//!
//! A worker instance is bound to one cache generation. It pre-caches the
//! asset manifest on install, purges every other generation on activate, and
//! answers GET requests cache-first with a network fallback and an offline
//! shell for navigations.

mod message;

pub use message::WorkerMessage;

use color_eyre::Report;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use url::Url;

use crate::attempt::best_effort;
use crate::cache::{CacheKey, CacheStorage, ResponseSnapshot};
use crate::net::{Network, Request};

/// Generation name of the shipped worker.
pub const DEFAULT_CACHE_NAME: &str = "cloze-pwa-v1";

/// Core assets pre-cached on install, relative to the worker scope.
pub const CORE_ASSETS: &[&str] = &[
  "./",
  "./index.html",
  "./style.css",
  "./app.js",
  "./manifest.webmanifest",
  "./icon-192.png",
  "./icon-512.png",
];

/// Document served to navigations when the network is unreachable.
pub const OFFLINE_DOCUMENT: &str = "./index.html";

/// Identifier of a worker instance within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "worker#{}", self.0)
  }
}

/// When a freshly installed worker takes over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
  /// Wait in the installed state until told to skip waiting
  #[default]
  Deferred,
  /// Skip waiting as soon as install succeeds
  OnInstall,
}

/// Everything compiled into one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerScript {
  /// Cache generation name; the version marker
  pub cache_name: String,
  /// Ordered manifest of scope-relative asset paths
  pub assets: Vec<String>,
  /// Scope-relative path of the offline shell document
  pub offline_document: String,
  #[serde(default)]
  pub activation: ActivationPolicy,
}

impl Default for WorkerScript {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      assets: CORE_ASSETS.iter().map(|s| s.to_string()).collect(),
      offline_document: OFFLINE_DOCUMENT.to_string(),
      activation: ActivationPolicy::Deferred,
    }
  }
}

/// Failures of worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("invalid asset path {path:?}: {source}")]
  InvalidPath {
    path: String,
    source: url::ParseError,
  },
  #[error("failed to fetch manifest asset {url}: {reason}")]
  ManifestAsset { url: Url, reason: String },
  #[error("manifest asset {url} returned status {status}")]
  ManifestStatus { url: Url, status: u16 },
  #[error("offline and not cached: {url}")]
  OfflineNotCached { url: Url },
  #[error("cache storage failed: {0}")]
  Storage(Report),
}

impl From<Report> for WorkerError {
  fn from(report: Report) -> Self {
    Self::Storage(report)
  }
}

/// The set of pages a worker may take control of.
pub trait Clients {
  /// Make `worker` the controller of every open page in scope.
  fn claim(&self, worker: WorkerId);
}

/// One running worker instance.
pub struct Worker<S: CacheStorage, N: Network> {
  id: WorkerId,
  script: WorkerScript,
  scope: Url,
  storage: Arc<S>,
  network: Arc<N>,
  skip_waiting: AtomicBool,
  /// Cache writes still running after their response was returned
  background: Mutex<Background>,
}

#[derive(Default)]
struct Background {
  writes: JoinSet<()>,
  /// Set once the worker is superseded; no new writes start after that
  retired: bool,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(
    id: WorkerId,
    script: WorkerScript,
    scope: Url,
    storage: Arc<S>,
    network: Arc<N>,
  ) -> Self {
    Self {
      id,
      script,
      scope,
      storage,
      network,
      skip_waiting: AtomicBool::new(false),
      background: Mutex::new(Background::default()),
    }
  }

  pub fn id(&self) -> WorkerId {
    self.id
  }

  pub fn script(&self) -> &WorkerScript {
    &self.script
  }

  pub fn cache_name(&self) -> &str {
    &self.script.cache_name
  }

  /// Resolve a scope-relative path to an absolute URL.
  pub fn resolve(&self, path: &str) -> Result<Url, WorkerError> {
    self
      .scope
      .join(path)
      .map_err(|source| WorkerError::InvalidPath {
        path: path.to_string(),
        source,
      })
  }

  /// Ask to be activated without waiting.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn wants_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Pre-cache the whole manifest into this worker's generation.
  ///
  /// Every asset is fetched before anything is written; a single failed or
  /// non-2xx fetch fails the install and leaves storage untouched.
  pub async fn install(&self) -> Result<(), WorkerError> {
    let urls = self
      .script
      .assets
      .iter()
      .map(|path| self.resolve(path))
      .collect::<Result<Vec<_>, _>>()?;

    let fetches = urls.into_iter().map(|url| async move {
      let response = self
        .network
        .fetch(&Request::get(url.clone()))
        .await
        .map_err(|e| WorkerError::ManifestAsset {
          url: url.clone(),
          reason: e.to_string(),
        })?;

      if !response.is_ok() {
        return Err(WorkerError::ManifestStatus {
          url,
          status: response.status,
        });
      }

      Ok((CacheKey::get(url), response))
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(&self.script.cache_name, &entries)?;

    tracing::info!(
      worker = %self.id,
      generation = %self.script.cache_name,
      assets = entries.len(),
      "install complete"
    );

    if self.script.activation == ActivationPolicy::OnInstall {
      self.skip_waiting();
    }

    Ok(())
  }

  /// Purge every other generation, then take control of open pages.
  ///
  /// Returns the names of the purged generations.
  pub async fn activate(&self, clients: &impl Clients) -> Result<Vec<String>, WorkerError> {
    let mut purged = Vec::new();

    for name in self.storage.generation_names()? {
      if name == self.script.cache_name {
        continue;
      }
      if self.storage.delete_generation(&name)? {
        tracing::info!(worker = %self.id, generation = %name, "purged old generation");
        purged.push(name);
      }
    }

    clients.claim(self.id);
    Ok(purged)
  }

  /// Intercept a page request.
  ///
  /// Returns `None` when the request is not intercepted (any non-GET method);
  /// the caller must then go to the network itself.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Result<ResponseSnapshot, WorkerError>> {
    let key = CacheKey::for_request(request)?;
    Some(self.respond(request, key).await)
  }

  async fn respond(&self, request: &Request, key: CacheKey) -> Result<ResponseSnapshot, WorkerError> {
    if let Some(cached) = best_effort("cache lookup", self.storage.match_any(&key)).flatten() {
      tracing::debug!(url = %request.url, "served from cache");
      return Ok(cached);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(key, response.clone());
        }
        Ok(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "network fetch failed");
        if request.is_navigation() {
          let shell = CacheKey::get(self.resolve(&self.script.offline_document)?);
          if let Some(document) = best_effort("offline shell lookup", self.storage.match_any(&shell)).flatten() {
            tracing::info!(url = %request.url, "serving offline shell");
            return Ok(document);
          }
        }
        Err(WorkerError::OfflineNotCached {
          url: request.url.clone(),
        })
      }
    }
  }

  fn store_in_background(&self, key: CacheKey, response: ResponseSnapshot) {
    let storage = Arc::clone(&self.storage);
    let generation = self.script.cache_name.clone();

    let Ok(mut background) = self.background.lock() else {
      tracing::warn!("background set poisoned; skipping runtime cache write");
      return;
    };
    if background.retired {
      tracing::debug!(worker = %self.id, "retired; skipping runtime cache write");
      return;
    }
    background.writes.spawn(async move {
      best_effort("runtime cache write", storage.put(&generation, &key, &response));
    });
  }

  /// Stop starting runtime cache writes. Responses are still served.
  pub fn retire(&self) {
    let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
    background.retired = true;
  }

  /// Wait for every background cache write started so far.
  pub async fn wait_until_idle(&self) {
    let mut pending = match self.background.lock() {
      Ok(mut background) => std::mem::take(&mut background.writes),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }

  /// Receive a message posted by a page.
  pub fn handle_message(&self, data: &Value) {
    match WorkerMessage::parse(data) {
      Some(WorkerMessage::SkipWaiting) => {
        tracing::info!(worker = %self.id, "skip-waiting requested");
        self.skip_waiting();
      }
      None => tracing::debug!(worker = %self.id, "ignoring unrecognised message"),
    }
  }
}
