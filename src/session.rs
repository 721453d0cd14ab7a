//! Interactive session: one page load at a time, reloaded on cutover.

use color_eyre::{eyre::eyre, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::attempt::best_effort;
use crate::cache::{CacheStorage, ResponseSnapshot, SqliteStorage};
use crate::commands::{self, COMMANDS};
use crate::event::{Event, EventHandler};
use crate::host::{RegistrationStore, ScriptSource, ServiceWorkerContainer};
use crate::net::{Network, Request};
use crate::update::ui::{console_ui, ChannelReloader};
use crate::update::{UpdateController, UpdateOptions};
use crate::worker::{WorkerId, WorkerScript};

/// Longest body preview printed for a response
const PREVIEW_CHARS: usize = 72;

/// Why a page load ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
  Reload,
  Quit,
}

/// Result of one typed command
#[derive(Debug, PartialEq, Eq)]
enum Step {
  Reply(String),
  Quit,
}

/// Everything that survives a page reload.
pub struct Session<N: Network> {
  pub origin: Url,
  /// Script registered when the source cannot be read at page load
  pub script: WorkerScript,
  pub options: UpdateOptions,
  pub storage: Arc<SqliteStorage>,
  pub network: Arc<N>,
  pub registrations: Arc<dyn RegistrationStore>,
  pub source: Arc<dyn ScriptSource>,
  /// `false` simulates a host without worker support
  pub worker_support: bool,
}

impl<N: Network> Session<N> {
  /// Run page loads until the user quits.
  pub async fn run(&self, events: &mut EventHandler) -> Result<()> {
    println!("clozeshell at {}. Type `help` for commands.", self.origin);

    loop {
      match self.load_page(events).await? {
        Exit::Reload => println!("[page] reloaded"),
        Exit::Quit => return Ok(()),
      }
    }
  }

  async fn load_page(&self, events: &mut EventHandler) -> Result<Exit> {
    let container = if self.worker_support {
      let container = ServiceWorkerContainer::new(
        self.origin.clone(),
        Arc::clone(&self.storage),
        Arc::clone(&self.network),
        Arc::clone(&self.registrations),
        Arc::clone(&self.source),
      );
      container.restore()?;
      Some(container)
    } else {
      None
    };

    let script =
      best_effort("worker script load", self.source.load()).unwrap_or_else(|| self.script.clone());

    let (clicks_tx, clicks_rx) = mpsc::unbounded_channel();
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let controller = UpdateController::new(
      container.clone(),
      script,
      console_ui(),
      Arc::new(ChannelReloader(reload_tx)),
      self.options.clone(),
    );
    let controller_task = tokio::spawn(controller.run(clicks_rx));

    let page = Page {
      origin: self.origin.clone(),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      container: container.clone(),
      clicks: clicks_tx,
    };

    let exit = loop {
      tokio::select! {
        Some(()) = reload_rx.recv() => break Exit::Reload,
        event = events.next() => match event {
          Some(Event::Line(line)) => match page.execute(&line).await {
            Ok(Step::Reply(text)) => {
              if !text.is_empty() {
                println!("{}", text);
              }
            }
            Ok(Step::Quit) => break Exit::Quit,
            Err(e) => println!("error: {}", e),
          },
          Some(Event::Interrupt) | Some(Event::Closed) | None => break Exit::Quit,
        },
      }
    };

    // Closing the click channel ends the controller if it is still running
    drop(page);
    if let Err(e) = controller_task.await {
      tracing::warn!(error = %e, "update controller task failed");
    }

    // The next page must see the activation fully recorded
    if exit == Exit::Reload {
      if let Some(container) = &container {
        container.settle().await;
      }
    }

    Ok(exit)
  }
}

/// One page load's view of the app.
struct Page<N: Network> {
  origin: Url,
  storage: Arc<SqliteStorage>,
  network: Arc<N>,
  container: Option<ServiceWorkerContainer<SqliteStorage, N>>,
  clicks: mpsc::UnboundedSender<()>,
}

impl<N: Network> Page<N> {
  async fn execute(&self, line: &str) -> Result<Step> {
    if line.trim().is_empty() {
      return Ok(Step::Reply(String::new()));
    }
    let Some((command, arg)) = commands::resolve(line) else {
      return Ok(Step::Reply(format!(
        "unknown command {:?}; type `help`",
        line.trim()
      )));
    };

    match command.name {
      "update" => Ok(Step::Reply(self.update())),
      "get" => {
        if arg.is_empty() {
          return Err(eyre!("usage: {}", command.usage));
        }
        let url = self.resolve(arg)?;
        let response = self.fetch(Request::get(url.clone())).await?;
        Ok(Step::Reply(describe(&url, &response)))
      }
      "open" => {
        let url = self.resolve(if arg.is_empty() { "./" } else { arg })?;
        let response = self.fetch(Request::navigate(url.clone())).await?;
        Ok(Step::Reply(describe(&url, &response)))
      }
      "status" => self.status().map(Step::Reply),
      "help" => Ok(Step::Reply(help())),
      "quit" => Ok(Step::Quit),
      other => Err(eyre!("unhandled command {}", other)),
    }
  }

  fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {:?}: {}", path, e))
  }

  async fn fetch(&self, request: Request) -> Result<ResponseSnapshot> {
    match &self.container {
      Some(container) => container.fetch(&request).await,
      None => Ok(self.network.fetch(&request).await?),
    }
  }

  fn update(&self) -> String {
    let Some(container) = &self.container else {
      return "offline support is unavailable on this host".to_string();
    };
    let waiting = container.registration().and_then(|r| r.waiting);

    // The controller also clears a stale banner when nothing is waiting
    let _ = self.clicks.send(());

    match waiting {
      Some(_) => String::new(),
      None => "no update waiting".to_string(),
    }
  }

  fn status(&self) -> Result<String> {
    let mut out = String::new();

    match &self.container {
      None => out.push_str("worker support: unavailable\n"),
      Some(container) => {
        let label = |id: Option<WorkerId>| match id {
          None => "-".to_string(),
          Some(id) => {
            let name = container.cache_name_of(id).unwrap_or_default();
            let state = container
              .state_of(id)
              .map(|s| s.to_string())
              .unwrap_or_default();
            format!("{} ({}, {})", id, name, state)
          }
        };

        let _ = writeln!(out, "controller: {}", label(container.controller()));
        match container.registration() {
          None => out.push_str("registration: none\n"),
          Some(registration) => {
            let _ = writeln!(out, "installing: {}", label(registration.installing));
            let _ = writeln!(out, "waiting:    {}", label(registration.waiting));
            let _ = writeln!(out, "active:     {}", label(registration.active));
          }
        }
      }
    }

    let generations = self.storage.generations()?;
    if generations.is_empty() {
      out.push_str("caches: none");
    } else {
      out.push_str("caches:");
      for generation in generations {
        let _ = write!(out, "\n  {} ({} entries)", generation.name, generation.entries);
      }
    }

    Ok(out)
  }
}

fn help() -> String {
  COMMANDS
    .iter()
    .map(|cmd| format!("  {:<14} {}", cmd.usage, cmd.description))
    .collect::<Vec<_>>()
    .join("\n")
}

/// One-line summary of a response with a short body preview.
fn describe(url: &Url, response: &ResponseSnapshot) -> String {
  let mut line = format!("{} {} ({} bytes", response.status, url, response.body.len());
  if let Some(content_type) = response.header("content-type") {
    let _ = write!(line, ", {}", content_type);
  }
  line.push(')');

  let text = String::from_utf8_lossy(&response.body);
  if let Some(first) = text.lines().find(|l| !l.trim().is_empty()) {
    let preview: String = first.trim().chars().take(PREVIEW_CHARS).collect();
    let _ = write!(line, "\n  {}", preview);
  }
  line
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{scope, script, FakeNetwork, Harness};

  fn page(harness: &Harness, container: bool) -> (Page<FakeNetwork>, mpsc::UnboundedReceiver<()>) {
    let (clicks, rx) = mpsc::unbounded_channel();
    let page = Page {
      origin: scope(),
      storage: Arc::clone(&harness.storage),
      network: Arc::clone(&harness.network),
      container: container.then(|| harness.container()),
      clicks,
    };
    (page, rx)
  }

  fn reply(step: Step) -> String {
    match step {
      Step::Reply(text) => text,
      Step::Quit => panic!("unexpected quit"),
    }
  }

  #[tokio::test]
  async fn test_get_is_served_from_cache_offline() {
    let harness = Harness::new("v1");
    let (page, _clicks) = page(&harness, true);
    let container = page.container.clone().unwrap();
    container.register(script("v1")).unwrap();
    container.settle().await;

    harness.network.set_online(false);
    let text = reply(page.execute("get ./app.js").await.unwrap());

    assert!(text.starts_with("200 https://cards.example.test/app/app.js"));
    assert!(text.contains("app.js v1"));
  }

  #[tokio::test]
  async fn test_open_defaults_to_start_page() {
    let harness = Harness::new("v1");
    let (page, _clicks) = page(&harness, true);
    let container = page.container.clone().unwrap();
    container.register(script("v1")).unwrap();
    container.settle().await;

    harness.network.set_online(false);
    let text = reply(page.execute("o").await.unwrap());
    assert!(text.contains("index v1"));
  }

  #[tokio::test]
  async fn test_get_without_worker_goes_to_network() {
    let harness = Harness::new("v1");
    let (page, _clicks) = page(&harness, false);

    let text = reply(page.execute("get ./style.css").await.unwrap());
    assert!(text.contains("style.css v1"));

    harness.network.set_online(false);
    assert!(page.execute("get ./style.css").await.is_err());
    assert!(page.execute("get").await.is_err());
  }

  #[tokio::test]
  async fn test_update_without_waiting_worker_still_notifies_controller() {
    let harness = Harness::new("v1");
    let (page, mut clicks) = page(&harness, true);

    let text = reply(page.execute("update").await.unwrap());
    assert_eq!(text, "no update waiting");
    assert_eq!(clicks.try_recv(), Ok(()));
  }

  #[tokio::test]
  async fn test_status_lists_workers_and_caches() {
    let harness = Harness::new("v1");
    let (page, _clicks) = page(&harness, true);
    let container = page.container.clone().unwrap();

    let before = reply(page.execute("status").await.unwrap());
    assert!(before.contains("registration: none"));
    assert!(before.contains("caches: none"));

    container.register(script("v1")).unwrap();
    container.settle().await;
    let after = reply(page.execute("st").await.unwrap());
    assert!(after.contains("controller: worker#1 (v1, activated)"));
    assert!(after.contains("v1 (7 entries)"));
  }

  #[tokio::test]
  async fn test_quit_and_unknown_commands() {
    let harness = Harness::new("v1");
    let (page, _clicks) = page(&harness, false);

    assert_eq!(page.execute("quit").await.unwrap(), Step::Quit);
    assert!(reply(page.execute("frobnicate").await.unwrap()).starts_with("unknown command"));
    assert!(reply(page.execute("help").await.unwrap()).contains("get <path>"));
  }
}
