//! Page-side update controller.
//!
//! Registers the worker on load, watches the registration for a waiting
//! worker, shows the update banner, sends the skip-waiting directive when
//! the user asks for it, and reloads the page once when control passes to
//! the new worker.

mod state;
pub mod ui;

pub use state::{Banner, Signal, UpdateState};
pub use ui::{Reloader, UpdateUi};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::attempt::best_effort;
use crate::cache::CacheStorage;
use crate::host::{HostEvent, ServiceWorkerContainer, WorkerState};
use crate::net::Network;
use crate::worker::{WorkerId, WorkerMessage, WorkerScript};

const BUTTON_LABEL: &str = "Update";
const BUTTON_BUSY_LABEL: &str = "Updating…";
const AVAILABLE_MESSAGE: &str = "Update available";

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
  /// Delay after load before re-deriving the banner from scratch
  pub sanity_recheck: Duration,
  /// Also ask the registration to look for a newer script on cutover
  pub check_for_update_on_cutover: bool,
}

impl Default for UpdateOptions {
  fn default() -> Self {
    Self {
      sanity_recheck: Duration::from_millis(300),
      check_for_update_on_cutover: true,
    }
  }
}

/// Install observed through an update-found signal.
#[derive(Debug, Clone, Copy)]
struct TrackedInstall {
  worker: WorkerId,
  /// Whether the page had a controller when the install began
  controlled: bool,
}

/// Owns the page's side of the update lifecycle for one page session.
pub struct UpdateController<S: CacheStorage, N: Network> {
  /// `None` when the host has no worker support
  host: Option<ServiceWorkerContainer<S, N>>,
  script: WorkerScript,
  ui: UpdateUi,
  reloader: Arc<dyn Reloader>,
  options: UpdateOptions,
  state: UpdateState,
  tracked: Option<TrackedInstall>,
  /// One-shot reload guard; set at most once per page session
  reload_fired: bool,
}

impl<S: CacheStorage, N: Network> UpdateController<S, N> {
  pub fn new(
    host: Option<ServiceWorkerContainer<S, N>>,
    script: WorkerScript,
    ui: UpdateUi,
    reloader: Arc<dyn Reloader>,
    options: UpdateOptions,
  ) -> Self {
    Self {
      host,
      script,
      ui,
      reloader,
      options,
      state: UpdateState::Unregistered,
      tracked: None,
      reload_fired: false,
    }
  }

  pub fn state(&self) -> UpdateState {
    self.state
  }

  fn apply(&mut self, signal: Signal) {
    let next = self.state.on(signal);
    if next != self.state {
      tracing::debug!(from = ?self.state, to = ?next, ?signal, "update state");
    }
    self.state = next;
  }

  /// Push the banner projection of the current state to the page.
  fn render(&self) {
    let Some((banner, button)) = self.ui.controls() else {
      return;
    };

    let (hidden, label, disabled) = match self.state.banner() {
      Banner::Hidden => (true, BUTTON_LABEL, false),
      Banner::Available => (false, BUTTON_LABEL, false),
      Banner::Updating => (false, BUTTON_BUSY_LABEL, true),
    };
    banner.set_hidden(hidden);
    button.set_text(label);
    button.set_disabled(disabled);

    if self.state.banner() == Banner::Available {
      if let Some(status) = &self.ui.status {
        status.set_text(AVAILABLE_MESSAGE);
      }
    }
  }

  /// Page load: register the worker and derive the initial banner.
  ///
  /// Registration failure leaves the page fully usable without offline or
  /// update support.
  pub fn start(&mut self) {
    let Some(host) = self.host.clone() else {
      tracing::info!("worker support unavailable; running without offline cache");
      return;
    };

    self.apply(Signal::Register);
    match best_effort("worker registration", host.register(self.script.clone())) {
      Some(registration) => {
        self.apply(Signal::Registered);
        // Start hidden whatever the page showed before
        self.render();
        if registration.waiting.is_some() {
          self.apply(Signal::WaitingPresent);
          self.render();
        }
      }
      None => self.apply(Signal::RegistrationFailed),
    }
  }

  /// Re-derive banner visibility from the registration as it is now.
  pub fn recheck(&mut self) {
    let waiting = self
      .host
      .as_ref()
      .and_then(|host| host.registration())
      .and_then(|registration| registration.waiting);

    self.apply(if waiting.is_some() {
      Signal::WaitingPresent
    } else {
      Signal::WaitingAbsent
    });
    self.render();
  }

  pub fn handle_event(&mut self, event: HostEvent) {
    match event {
      HostEvent::UpdateFound { worker, controlled } => {
        self.tracked = Some(TrackedInstall { worker, controlled });
      }
      HostEvent::StateChange {
        worker,
        state: WorkerState::Installed,
      } => {
        // Only updates get a banner, never the first install
        if let Some(tracked) = self.tracked {
          if tracked.worker == worker && tracked.controlled {
            self.recheck();
          }
        }
      }
      HostEvent::StateChange { .. } => {}
      HostEvent::ControllerChange { worker } => self.on_controller_change(worker),
    }
  }

  /// The user pressed the update button.
  pub fn request_cutover(&mut self) {
    if self.ui.controls().is_none() {
      return;
    }
    if matches!(
      self.state,
      UpdateState::CutoverRequested | UpdateState::Reloading
    ) {
      tracing::debug!("cutover already in progress");
      return;
    }
    let Some(host) = self.host.clone() else {
      return;
    };

    let Some(waiting) = host.registration().and_then(|r| r.waiting) else {
      // Nothing to activate; drop the stale banner
      self.apply(Signal::WaitingAbsent);
      self.render();
      return;
    };

    self.apply(Signal::WaitingPresent);
    self.apply(Signal::Cutover);
    self.render();

    tracing::info!(worker = %waiting, "sending skip-waiting");
    host.post_message(waiting, WorkerMessage::SkipWaiting.to_value());

    if self.options.check_for_update_on_cutover {
      best_effort("update check", host.update());
    }
  }

  fn on_controller_change(&mut self, worker: WorkerId) {
    if self.reload_fired {
      return;
    }
    self.reload_fired = true;
    self.apply(Signal::ControllerChanged);

    tracing::info!(worker = %worker, "controller changed; reloading");
    self.reloader.reload();
  }

  /// Drive the controller for one page session.
  ///
  /// Handles lifecycle events, button presses and the sanity recheck until
  /// the page reloads or the click channel closes. Returns the final state.
  pub async fn run(mut self, mut clicks: mpsc::UnboundedReceiver<()>) -> UpdateState {
    let Some(host) = self.host.clone() else {
      self.start();
      return self.state;
    };

    let mut events = host.subscribe();
    self.start();

    let sanity = tokio::time::sleep(self.options.sanity_recheck);
    tokio::pin!(sanity);
    let mut sanity_done = false;

    while !self.reload_fired {
      tokio::select! {
        event = events.recv() => match event {
          Ok(event) => self.handle_event(event),
          Err(RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "missed lifecycle events; rechecking");
            self.recheck();
          }
          Err(RecvError::Closed) => break,
        },
        click = clicks.recv() => match click {
          Some(()) => self.request_cutover(),
          None => break,
        },
        _ = &mut sanity, if !sanity_done => {
          sanity_done = true;
          self.recheck();
        }
      }
    }

    self.state
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::testing::{script, FakeNetwork, Harness, RecordingElement, RecordingReloader};
  use crate::update::ui::Element;

  struct Page {
    controller: UpdateController<SqliteStorage, FakeNetwork>,
    container: ServiceWorkerContainer<SqliteStorage, FakeNetwork>,
    events: tokio::sync::broadcast::Receiver<HostEvent>,
    banner: Arc<RecordingElement>,
    button: Arc<RecordingElement>,
    status: Arc<RecordingElement>,
    reloader: Arc<RecordingReloader>,
  }

  impl Page {
    /// Load a page under the harness's current durable state.
    fn load(harness: &Harness, script: WorkerScript) -> Self {
      let container = harness.container();
      let events = container.subscribe();
      let banner = RecordingElement::new();
      // Markup default: a visible banner that must be hidden on load
      banner.set_hidden(false);
      let button = RecordingElement::new();
      let status = RecordingElement::new();
      let reloader = Arc::new(RecordingReloader::default());
      let ui = UpdateUi {
        banner: Some(banner.clone()),
        button: Some(button.clone()),
        status: Some(status.clone()),
      };
      let controller = UpdateController::new(
        Some(container.clone()),
        script,
        ui,
        reloader.clone(),
        UpdateOptions::default(),
      );
      Self {
        controller,
        container,
        events,
        banner,
        button,
        status,
        reloader,
      }
    }

    /// Let background work finish and feed every event to the controller.
    async fn settle(&mut self) {
      self.container.settle().await;
      while let Ok(event) = self.events.try_recv() {
        self.controller.handle_event(event);
      }
    }
  }

  async fn install_v1(harness: &Harness) {
    let mut page = Page::load(harness, script("v1"));
    page.controller.start();
    page.settle().await;
  }

  #[tokio::test]
  async fn test_fresh_install_shows_no_banner() {
    let harness = Harness::new("v1");
    let mut page = Page::load(&harness, script("v1"));

    page.controller.start();
    page.settle().await;

    assert!(page.banner.hidden());
    assert_ne!(page.controller.state(), UpdateState::UpdateWaiting);
    assert_eq!(page.status.text(), "");
  }

  #[tokio::test]
  async fn test_fresh_install_claim_reloads_once() {
    let harness = Harness::new("v1");
    let mut page = Page::load(&harness, script("v1"));

    page.controller.start();
    page.settle().await;

    assert_eq!(page.reloader.count(), 1);
    assert_eq!(page.controller.state(), UpdateState::Reloading);
  }

  #[tokio::test]
  async fn test_update_available_shows_banner() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");

    let mut page = Page::load(&harness, script("v2"));
    page.controller.start();
    assert!(page.banner.hidden());
    page.settle().await;

    assert!(!page.banner.hidden());
    assert_eq!(page.status.text(), "Update available");
    assert_eq!(page.button.text(), "Update");
    assert!(!page.button.disabled());
    assert_eq!(page.controller.state(), UpdateState::UpdateWaiting);
    assert_eq!(page.reloader.count(), 0);
  }

  #[tokio::test]
  async fn test_waiting_worker_at_load_shows_banner_immediately() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");

    let mut first = Page::load(&harness, script("v2"));
    first.controller.start();
    first.settle().await;
    assert!(!first.banner.hidden());

    // Reopen offline: the staged update is still there on the next load
    harness.network.set_online(false);
    let mut page = Page::load(&harness, script("v2"));
    page.controller.start();

    assert_eq!(page.controller.state(), UpdateState::UpdateWaiting);
    assert!(!page.banner.hidden());
    assert_eq!(page.status.text(), "Update available");

    page.settle().await;
    assert!(!page.banner.hidden());
  }

  #[tokio::test]
  async fn test_update_applied_reloads_exactly_once() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");
    let mut page = Page::load(&harness, script("v2"));
    page.controller.start();
    page.settle().await;
    let v2 = page.container.registration().unwrap().waiting.unwrap();

    page.controller.request_cutover();
    assert!(page.button.disabled());
    assert_eq!(page.button.text(), "Updating…");
    page.settle().await;

    assert_eq!(page.container.controller(), Some(v2));
    assert_eq!(page.container.state_of(v2), Some(WorkerState::Activated));
    assert_eq!(page.reloader.count(), 1);
    assert_eq!(page.controller.state(), UpdateState::Reloading);
  }

  #[tokio::test]
  async fn test_double_click_sends_one_directive() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");
    let mut page = Page::load(&harness, script("v2"));
    page.controller.start();
    page.settle().await;

    page.controller.request_cutover();
    page.controller.request_cutover();
    page.settle().await;

    // Each accepted press also runs one update check
    assert_eq!(harness.source.loads(), 1);
    assert_eq!(page.reloader.count(), 1);
  }

  #[tokio::test]
  async fn test_repeated_controller_change_reloads_once() {
    let harness = Harness::new("v1");
    let mut page = Page::load(&harness, script("v1"));

    for n in 1..=5 {
      page
        .controller
        .handle_event(HostEvent::ControllerChange { worker: WorkerId(n) });
    }

    assert_eq!(page.reloader.count(), 1);
  }

  #[tokio::test]
  async fn test_click_without_waiting_worker_resets_banner() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    let mut page = Page::load(&harness, script("v1"));
    page.controller.start();
    page.settle().await;
    // Stale banner left visible by something else
    page.banner.set_hidden(false);
    let requests_before = harness.network.requests().len();

    page.controller.request_cutover();
    page.settle().await;

    assert!(page.banner.hidden());
    assert!(!page.button.disabled());
    assert_eq!(page.controller.state(), UpdateState::Registered);
    assert_eq!(page.reloader.count(), 0);
    assert_eq!(harness.network.requests().len(), requests_before);
  }

  #[tokio::test]
  async fn test_click_without_controls_is_ignored() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");
    let container = harness.container();
    let mut controller = UpdateController::new(
      Some(container.clone()),
      script("v2"),
      UpdateUi::default(),
      Arc::new(RecordingReloader::default()),
      UpdateOptions::default(),
    );
    controller.start();
    container.settle().await;
    let waiting = container.registration().unwrap().waiting;
    assert!(waiting.is_some());

    controller.request_cutover();
    container.settle().await;

    assert_eq!(container.registration().unwrap().waiting, waiting);
  }

  #[tokio::test]
  async fn test_unsupported_host_stays_unregistered() {
    let reloader = Arc::new(RecordingReloader::default());
    let banner = RecordingElement::new();
    let button = RecordingElement::new();
    let mut controller: UpdateController<SqliteStorage, FakeNetwork> = UpdateController::new(
      None,
      script("v1"),
      UpdateUi {
        banner: Some(banner.clone()),
        button: Some(button.clone()),
        status: None,
      },
      reloader.clone(),
      UpdateOptions::default(),
    );

    controller.start();
    controller.request_cutover();

    assert_eq!(controller.state(), UpdateState::Unregistered);
    assert_eq!(reloader.count(), 0);
  }

  #[tokio::test]
  async fn test_registration_failure_is_swallowed() {
    let harness = Harness::new("v1");
    let mut page = Page::load(&harness, script(""));

    page.controller.start();
    page.settle().await;

    assert_eq!(page.controller.state(), UpdateState::Unregistered);
    assert_eq!(page.container.registration(), None);
  }

  #[tokio::test]
  async fn test_failed_update_check_keeps_banner_state() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");
    harness.source.break_source();
    let mut page = Page::load(&harness, script("v2"));
    page.controller.start();
    page.settle().await;

    page.controller.request_cutover();
    assert_eq!(page.controller.state(), UpdateState::CutoverRequested);
    assert!(!page.banner.hidden());
    page.settle().await;

    assert_eq!(page.reloader.count(), 1);
  }

  #[tokio::test]
  async fn test_sanity_recheck_rederives_banner() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    let container = harness.container();
    let banner = RecordingElement::new();
    let button = RecordingElement::new();
    let (clicks_tx, clicks) = mpsc::unbounded_channel();
    let controller = UpdateController::new(
      Some(container.clone()),
      script("v1"),
      UpdateUi {
        banner: Some(banner.clone()),
        button: Some(button.clone()),
        status: None,
      },
      Arc::new(RecordingReloader::default()),
      UpdateOptions {
        sanity_recheck: Duration::from_millis(60),
        ..UpdateOptions::default()
      },
    );
    let task = tokio::spawn(controller.run(clicks));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(banner.hidden());
    // Something left the banner showing after load
    banner.set_hidden(false);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(banner.hidden());

    drop(clicks_tx);
    assert_eq!(task.await.unwrap(), UpdateState::Registered);
  }

  #[tokio::test]
  async fn test_run_loop_applies_update_on_click() {
    let harness = Harness::new("v1");
    install_v1(&harness).await;
    harness.deploy("v2");
    let container = harness.container();
    let reloader = Arc::new(RecordingReloader::default());
    let banner = RecordingElement::new();
    let button = RecordingElement::new();
    let (clicks_tx, clicks) = mpsc::unbounded_channel();
    let controller = UpdateController::new(
      Some(container.clone()),
      script("v2"),
      UpdateUi {
        banner: Some(banner.clone()),
        button: Some(button.clone()),
        status: None,
      },
      reloader.clone(),
      UpdateOptions::default(),
    );
    let task = tokio::spawn(controller.run(clicks));

    container.settle().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!banner.hidden());

    clicks_tx.send(()).unwrap();
    clicks_tx.send(()).unwrap();
    let final_state = task.await.unwrap();
    container.settle().await;

    assert_eq!(final_state, UpdateState::Reloading);
    assert_eq!(reloader.count(), 1);
  }
}
