//! Shared fakes for unit tests.

use color_eyre::Result;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{ResponseSnapshot, SqliteStorage};
use crate::db::Database;
use crate::host::{ScriptSource, ServiceWorkerContainer};
use crate::net::{Network, NetworkError, Request};
use crate::update::ui::{Element, Reloader};
use crate::worker::{WorkerScript, CORE_ASSETS};

/// Scope every test worker is registered under.
pub fn scope() -> Url {
  Url::parse("https://cards.example.test/app/").unwrap()
}

/// Script for a given generation name with the default manifest.
pub fn script(name: &str) -> WorkerScript {
  WorkerScript {
    cache_name: name.to_string(),
    ..WorkerScript::default()
  }
}

/// In-memory origin server that can be switched offline.
pub struct FakeNetwork {
  routes: Mutex<HashMap<Url, ResponseSnapshot>>,
  online: AtomicBool,
  requests: Mutex<Vec<(Method, Url)>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      requests: Mutex::new(Vec::new()),
    }
  }

  /// Serve every core asset with a body naming the asset and `version`.
  pub fn with_core_assets(version: &str) -> Self {
    let network = Self::new();
    network.publish(version);
    network
  }

  /// Replace all core assets with a new deployed version.
  pub fn publish(&self, version: &str) {
    for path in CORE_ASSETS {
      let name = match path.trim_start_matches("./") {
        "" => "index",
        other => other,
      };
      self.serve(path, ResponseSnapshot::new(200, format!("{} {}", name, version)));
    }
  }

  pub fn serve(&self, path: &str, response: ResponseSnapshot) {
    let url = scope().join(path).unwrap();
    self.routes.lock().unwrap().insert(url, response);
  }

  pub fn remove(&self, path: &str) {
    let url = scope().join(path).unwrap();
    self.routes.lock().unwrap().remove(&url);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Every request seen so far, online or not.
  pub fn requests(&self) -> Vec<(Method, Url)> {
    self.requests.lock().unwrap().clone()
  }
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, NetworkError> {
    self
      .requests
      .lock()
      .unwrap()
      .push((request.method.clone(), request.url.clone()));

    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable("offline".to_string()));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&request.url)
        .cloned()
        .unwrap_or_else(|| ResponseSnapshot::new(404, "not found")),
    )
  }
}

/// Script source whose "deployed" script tests can swap.
pub struct SharedScript {
  script: Mutex<Option<WorkerScript>>,
  loads: AtomicUsize,
}

impl SharedScript {
  pub fn new(script: WorkerScript) -> Self {
    Self {
      script: Mutex::new(Some(script)),
      loads: AtomicUsize::new(0),
    }
  }

  pub fn set(&self, script: WorkerScript) {
    *self.script.lock().unwrap() = Some(script);
  }

  /// Make the next load fail, as an unreachable update check would.
  pub fn break_source(&self) {
    *self.script.lock().unwrap() = None;
  }

  /// Number of update checks made so far.
  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }
}

impl ScriptSource for SharedScript {
  fn load(&self) -> Result<WorkerScript> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    self
      .script
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| color_eyre::eyre::eyre!("script source unreachable"))
  }
}

/// Everything a host test needs, sharing one set of durable stores.
pub struct Harness {
  pub storage: Arc<SqliteStorage>,
  pub network: Arc<FakeNetwork>,
  pub db: Arc<Database>,
  pub source: Arc<SharedScript>,
}

impl Harness {
  pub fn new(deployed: &str) -> Self {
    Self {
      storage: Arc::new(SqliteStorage::open_in_memory().unwrap()),
      network: Arc::new(FakeNetwork::with_core_assets(deployed)),
      db: Arc::new(Database::open_in_memory().unwrap()),
      source: Arc::new(SharedScript::new(script(deployed))),
    }
  }

  /// A fresh page load: a new container restored from durable state.
  pub fn container(&self) -> ServiceWorkerContainer<SqliteStorage, FakeNetwork> {
    let container = ServiceWorkerContainer::new(
      scope(),
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
      self.db.clone(),
      self.source.clone(),
    );
    container.restore().unwrap();
    container
  }

  /// Deploy a new version: new asset bodies and a new script.
  pub fn deploy(&self, version: &str) {
    self.network.publish(version);
    self.source.set(script(version));
  }
}

/// Element that remembers what it was last told.
pub struct RecordingElement {
  hidden: AtomicBool,
  disabled: AtomicBool,
  text: Mutex<String>,
}

impl RecordingElement {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      hidden: AtomicBool::new(true),
      disabled: AtomicBool::new(false),
      text: Mutex::new(String::new()),
    })
  }

  pub fn hidden(&self) -> bool {
    self.hidden.load(Ordering::SeqCst)
  }

  pub fn disabled(&self) -> bool {
    self.disabled.load(Ordering::SeqCst)
  }

  pub fn text(&self) -> String {
    self.text.lock().unwrap().clone()
  }
}

impl Element for RecordingElement {
  fn set_hidden(&self, hidden: bool) {
    self.hidden.store(hidden, Ordering::SeqCst);
  }

  fn set_text(&self, text: &str) {
    *self.text.lock().unwrap() = text.to_string();
  }

  fn set_disabled(&self, disabled: bool) {
    self.disabled.store(disabled, Ordering::SeqCst);
  }
}

/// Reloader that counts reloads.
#[derive(Default)]
pub struct RecordingReloader(AtomicUsize);

impl RecordingReloader {
  pub fn count(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

impl Reloader for RecordingReloader {
  fn reload(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}
