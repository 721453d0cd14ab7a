//! Worker host: registration, lifecycle transitions, and page control.
//!
//! The container plays the part of the browser for the worker. It runs one
//! lifecycle job at a time (install, activation), keeps at most one
//! installing, one waiting and one active worker, tracks which worker
//! controls the page, and broadcasts lifecycle events to page-side
//! observers.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use url::Url;

use crate::attempt::best_effort;
use crate::cache::{CacheStorage, ResponseSnapshot};
use crate::net::{Network, Request};
use crate::worker::{Clients, Worker, WorkerId, WorkerScript};

/// Lifecycle state of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  Activated,
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Lifecycle signals published to page-side observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
  /// A new worker started installing. `controlled` records whether the page
  /// already had a controller at that moment.
  UpdateFound { worker: WorkerId, controlled: bool },
  StateChange { worker: WorkerId, state: WorkerState },
  /// The page's controller changed to `worker`
  ControllerChange { worker: WorkerId },
}

/// Point-in-time view of the registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
  pub installing: Option<WorkerId>,
  pub waiting: Option<WorkerId>,
  pub active: Option<WorkerId>,
}

/// Durable record of the active worker script and of an installed one
/// waiting to take over.
pub trait RegistrationStore: Send + Sync {
  fn load_active(&self) -> Result<Option<WorkerScript>>;
  fn save_active(&self, script: &WorkerScript) -> Result<()>;
  fn load_waiting(&self) -> Result<Option<WorkerScript>>;
  /// Record the waiting script, or clear it with `None`.
  fn save_waiting(&self, script: Option<&WorkerScript>) -> Result<()>;
}

/// Where update checks find the latest worker script.
pub trait ScriptSource: Send + Sync {
  fn load(&self) -> Result<WorkerScript>;
}

const EVENT_CAPACITY: usize = 64;

struct HostState<S: CacheStorage, N: Network> {
  next_id: u64,
  registered: bool,
  installing: Option<Arc<Worker<S, N>>>,
  waiting: Option<Arc<Worker<S, N>>>,
  active: Option<Arc<Worker<S, N>>>,
  controller: Option<WorkerId>,
  states: HashMap<WorkerId, WorkerState>,
}

impl<S: CacheStorage, N: Network> HostState<S, N> {
  fn snapshot(&self) -> RegistrationSnapshot {
    RegistrationSnapshot {
      installing: self.installing.as_ref().map(|w| w.id()),
      waiting: self.waiting.as_ref().map(|w| w.id()),
      active: self.active.as_ref().map(|w| w.id()),
    }
  }

  /// Record a state change. Redundant workers are forgotten once reported.
  fn transition(&mut self, worker: WorkerId, state: WorkerState) -> HostEvent {
    if state == WorkerState::Redundant {
      self.states.remove(&worker);
    } else {
      self.states.insert(worker, state);
    }
    HostEvent::StateChange { worker, state }
  }

  fn find(&self, id: WorkerId) -> Option<Arc<Worker<S, N>>> {
    [&self.installing, &self.waiting, &self.active]
      .into_iter()
      .flatten()
      .find(|w| w.id() == id)
      .cloned()
  }

  fn holds_script(&self, script: &WorkerScript) -> bool {
    [&self.installing, &self.waiting, &self.active]
      .into_iter()
      .flatten()
      .any(|w| w.script() == script)
  }
}

struct Inner<S: CacheStorage, N: Network> {
  scope: Url,
  storage: Arc<S>,
  network: Arc<N>,
  registrations: Arc<dyn RegistrationStore>,
  source: Arc<dyn ScriptSource>,
  state: Mutex<HostState<S, N>>,
  events: broadcast::Sender<HostEvent>,
  /// Serializes lifecycle jobs
  lifecycle: tokio::sync::Mutex<()>,
  jobs: Mutex<JoinSet<()>>,
}

/// The page's handle on worker registration, like `navigator.serviceWorker`.
pub struct ServiceWorkerContainer<S: CacheStorage, N: Network> {
  inner: Arc<Inner<S, N>>,
}

impl<S: CacheStorage, N: Network> Clone for ServiceWorkerContainer<S, N> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage, N: Network> ServiceWorkerContainer<S, N> {
  pub fn new(
    scope: Url,
    storage: Arc<S>,
    network: Arc<N>,
    registrations: Arc<dyn RegistrationStore>,
    source: Arc<dyn ScriptSource>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        scope,
        storage,
        network,
        registrations,
        source,
        state: Mutex::new(HostState {
          next_id: 1,
          registered: false,
          installing: None,
          waiting: None,
          active: None,
          controller: None,
          states: HashMap::new(),
        }),
        events,
        lifecycle: tokio::sync::Mutex::new(()),
        jobs: Mutex::new(JoinSet::new()),
      }),
    }
  }

  /// Load the persisted registration, as after a normal page load under an
  /// existing one. The active worker controls the page from the start; an
  /// installed worker waiting to take over is waiting again, without
  /// reinstalling.
  pub fn restore(&self) -> Result<()> {
    let Some(active) = self.inner.registrations.load_active()? else {
      return Ok(());
    };
    let waiting = self.restorable_waiting(&active)?;

    let mut state = self.inner.lock_state();
    let worker = self.inner.spawn_worker(&mut state, active);
    let id = worker.id();
    state.states.insert(id, WorkerState::Activated);
    state.active = Some(worker);
    state.controller = Some(id);
    state.registered = true;
    tracing::info!(worker = %id, "restored active worker");

    if let Some(script) = waiting {
      let worker = self.inner.spawn_worker(&mut state, script);
      state.states.insert(worker.id(), WorkerState::Installed);
      tracing::info!(worker = %worker.id(), generation = %worker.cache_name(), "restored waiting worker");
      state.waiting = Some(worker);
    }

    Ok(())
  }

  /// The persisted waiting script, if its generation is still in storage.
  fn restorable_waiting(&self, active: &WorkerScript) -> Result<Option<WorkerScript>> {
    let Some(script) = self.inner.registrations.load_waiting()? else {
      return Ok(None);
    };

    let cached = self
      .inner
      .storage
      .generation_names()?
      .contains(&script.cache_name);
    if script == *active || !cached {
      tracing::debug!(generation = %script.cache_name, "dropping stale waiting record");
      best_effort("clear waiting record", self.inner.registrations.save_waiting(None));
      return Ok(None);
    }

    Ok(Some(script))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
    self.inner.events.subscribe()
  }

  /// Worker currently controlling the page.
  pub fn controller(&self) -> Option<WorkerId> {
    self.inner.lock_state().controller
  }

  /// The registration, if one exists.
  pub fn registration(&self) -> Option<RegistrationSnapshot> {
    let state = self.inner.lock_state();
    state.registered.then(|| state.snapshot())
  }

  pub fn state_of(&self, worker: WorkerId) -> Option<WorkerState> {
    self.inner.lock_state().states.get(&worker).copied()
  }

  /// Generation name of a live worker.
  pub fn cache_name_of(&self, worker: WorkerId) -> Option<String> {
    self
      .inner
      .lock_state()
      .find(worker)
      .map(|w| w.cache_name().to_string())
  }

  /// Register a worker script. Installation continues in the background.
  ///
  /// Registering a script identical to one already installing, waiting or
  /// active changes nothing.
  pub fn register(&self, script: WorkerScript) -> Result<RegistrationSnapshot> {
    if script.cache_name.trim().is_empty() {
      return Err(eyre!("Worker script has an empty cache name"));
    }
    for path in script.assets.iter().chain([&script.offline_document]) {
      self
        .inner
        .scope
        .join(path)
        .map_err(|e| eyre!("Invalid asset path {:?}: {}", path, e))?;
    }

    let snapshot = {
      let mut state = self.inner.lock_state();
      state.registered = true;
      state.snapshot()
    };

    let inner = Arc::clone(&self.inner);
    self.spawn_job(async move { inner.install_job(script).await });

    Ok(snapshot)
  }

  /// Check the script source for a newer worker and register it.
  pub fn update(&self) -> Result<()> {
    let script = self.inner.source.load()?;
    self.register(script)?;
    Ok(())
  }

  /// Deliver a message to a worker. Fire-and-forget.
  pub fn post_message(&self, target: WorkerId, data: Value) {
    let (worker, is_waiting) = {
      let state = self.inner.lock_state();
      let is_waiting = state.waiting.as_ref().map(|w| w.id()) == Some(target);
      (state.find(target), is_waiting)
    };

    let Some(worker) = worker else {
      tracing::debug!(worker = %target, "message to unknown worker dropped");
      return;
    };

    worker.handle_message(&data);

    // A worker still installing picks the flag up when its install finishes
    if is_waiting && worker.wants_skip_waiting() {
      let inner = Arc::clone(&self.inner);
      self.spawn_job(async move {
        let _job = inner.lifecycle.lock().await;
        let still_waiting = inner
          .lock_state()
          .waiting
          .as_ref()
          .map(|w| w.id())
          == Some(target);
        if still_waiting {
          inner.activate_waiting().await;
        }
      });
    }
  }

  /// Fetch a resource on behalf of the page, through the controlling worker
  /// when there is one.
  pub async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot> {
    let controller = {
      let state = self.inner.lock_state();
      state.controller.and_then(|id| state.find(id))
    };

    if let Some(worker) = controller {
      if let Some(result) = worker.handle_fetch(request).await {
        return Ok(result?);
      }
    }

    Ok(self.inner.network.fetch(request).await?)
  }

  /// Wait until every pending lifecycle job and background cache write is
  /// done.
  pub async fn settle(&self) {
    loop {
      let mut pending = match self.inner.jobs.lock() {
        Ok(mut jobs) => std::mem::take(&mut *jobs),
        Err(_) => return,
      };
      if pending.is_empty() {
        break;
      }
      while pending.join_next().await.is_some() {}
    }

    let active = self.inner.lock_state().active.clone();
    if let Some(worker) = active {
      worker.wait_until_idle().await;
    }
  }

  fn spawn_job<F>(&self, job: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    match self.inner.jobs.lock() {
      Ok(mut jobs) => {
        jobs.spawn(job);
      }
      Err(_) => tracing::warn!("job set poisoned; lifecycle job dropped"),
    }
  }
}

impl<S: CacheStorage, N: Network> Inner<S, N> {
  fn lock_state(&self) -> MutexGuard<'_, HostState<S, N>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn emit(&self, events: impl IntoIterator<Item = HostEvent>) {
    for event in events {
      tracing::debug!(?event, "host event");
      // No receivers is fine; nobody is watching
      let _ = self.events.send(event);
    }
  }

  fn spawn_worker(&self, state: &mut HostState<S, N>, script: WorkerScript) -> Arc<Worker<S, N>> {
    let id = WorkerId(state.next_id);
    state.next_id += 1;
    Arc::new(Worker::new(
      id,
      script,
      self.scope.clone(),
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ))
  }

  async fn install_job(&self, script: WorkerScript) {
    let _job = self.lifecycle.lock().await;

    let (worker, controlled) = {
      let mut state = self.lock_state();
      if state.holds_script(&script) {
        tracing::debug!(generation = %script.cache_name, "script unchanged; nothing to install");
        return;
      }
      let worker = self.spawn_worker(&mut state, script);
      state.installing = Some(Arc::clone(&worker));
      state.states.insert(worker.id(), WorkerState::Installing);
      (worker, state.controller.is_some())
    };
    let id = worker.id();

    tracing::info!(worker = %id, generation = %worker.cache_name(), "installing");
    self.emit([
      HostEvent::UpdateFound {
        worker: id,
        controlled,
      },
      HostEvent::StateChange {
        worker: id,
        state: WorkerState::Installing,
      },
    ]);

    if let Err(e) = worker.install().await {
      tracing::warn!(worker = %id, error = %e, "install failed");
      let event = {
        let mut state = self.lock_state();
        state.installing = None;
        state.transition(id, WorkerState::Redundant)
      };
      self.emit([event]);
      return;
    }

    let (events, no_active) = {
      let mut state = self.lock_state();
      state.installing = None;
      let mut events = Vec::new();
      if let Some(previous) = state.waiting.replace(Arc::clone(&worker)) {
        events.push(state.transition(previous.id(), WorkerState::Redundant));
      }
      events.push(state.transition(id, WorkerState::Installed));
      (events, state.active.is_none())
    };
    self.emit(events);
    best_effort(
      "persist waiting worker",
      self.registrations.save_waiting(Some(worker.script())),
    );

    if no_active || worker.wants_skip_waiting() {
      self.activate_waiting().await;
    }
  }

  /// Promote the waiting worker. Callers hold the lifecycle lock.
  async fn activate_waiting(&self) {
    let (worker, previous, events) = {
      let mut state = self.lock_state();
      let Some(worker) = state.waiting.take() else {
        return;
      };
      let mut events = Vec::new();
      let previous = state.active.replace(Arc::clone(&worker));
      if let Some(previous) = &previous {
        events.push(state.transition(previous.id(), WorkerState::Redundant));
      }
      events.push(state.transition(worker.id(), WorkerState::Activating));
      (worker, previous, events)
    };
    self.emit(events);

    // Old runtime writes must land before the purge, not after it
    if let Some(previous) = previous {
      previous.retire();
      previous.wait_until_idle().await;
    }

    if let Err(e) = worker.activate(self).await {
      tracing::warn!(worker = %worker.id(), error = %e, "activation cleanup failed");
    }

    let event = self.lock_state().transition(worker.id(), WorkerState::Activated);
    self.emit([event]);
    tracing::info!(worker = %worker.id(), generation = %worker.cache_name(), "activated");

    best_effort(
      "persist registration",
      self.registrations.save_active(worker.script()),
    );
    best_effort("clear waiting record", self.registrations.save_waiting(None));
  }
}

impl<S: CacheStorage, N: Network> Clients for Inner<S, N> {
  fn claim(&self, worker: WorkerId) {
    let changed = {
      let mut state = self.lock_state();
      let changed = state.controller != Some(worker);
      state.controller = Some(worker);
      changed
    };
    if changed {
      self.emit([HostEvent::ControllerChange { worker }]);
    }
  }
}
