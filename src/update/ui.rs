//! The page surface the update controller drives.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A visible element: the banner, its action button, or a status line.
pub trait Element: Send + Sync {
  fn set_hidden(&self, hidden: bool);
  fn set_text(&self, text: &str);
  fn set_disabled(&self, disabled: bool);
}

/// Reloads the page.
pub trait Reloader: Send + Sync {
  fn reload(&self);
}

/// Elements of the update banner. Any of them may be missing from the page.
#[derive(Clone, Default)]
pub struct UpdateUi {
  pub banner: Option<Arc<dyn Element>>,
  pub button: Option<Arc<dyn Element>>,
  pub status: Option<Arc<dyn Element>>,
}

impl UpdateUi {
  /// Banner and button, when both are present.
  pub fn controls(&self) -> Option<(&dyn Element, &dyn Element)> {
    Some((self.banner.as_deref()?, self.button.as_deref()?))
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Shown {
  hidden: bool,
  text: String,
  disabled: bool,
}

/// Element that reports its changes on the terminal.
pub struct ConsoleElement {
  role: &'static str,
  shown: Mutex<Shown>,
}

impl ConsoleElement {
  pub fn new(role: &'static str) -> Arc<Self> {
    Arc::new(Self {
      role,
      shown: Mutex::new(Shown {
        hidden: true,
        ..Shown::default()
      }),
    })
  }

  fn update(&self, change: impl FnOnce(&mut Shown)) {
    let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());
    let before = shown.clone();
    change(&mut shown);
    if *shown == before {
      return;
    }

    match self.role {
      "banner" if shown.hidden != before.hidden => {
        if shown.hidden {
          println!("[update] banner dismissed");
        } else {
          println!("[update] a new version is ready; type `update` to apply it");
        }
      }
      "button" => {
        if shown.disabled && !before.disabled {
          println!("[update] {}", shown.text);
        }
      }
      _ if shown.text != before.text && !shown.text.is_empty() => {
        println!("[{}] {}", self.role, shown.text);
      }
      _ => {}
    }
  }
}

impl Element for ConsoleElement {
  fn set_hidden(&self, hidden: bool) {
    self.update(|s| s.hidden = hidden);
  }

  fn set_text(&self, text: &str) {
    self.update(|s| s.text = text.to_string());
  }

  fn set_disabled(&self, disabled: bool) {
    self.update(|s| s.disabled = disabled);
  }
}

/// Terminal banner: a banner, an action button and a status line.
pub fn console_ui() -> UpdateUi {
  UpdateUi {
    banner: Some(ConsoleElement::new("banner")),
    button: Some(ConsoleElement::new("button")),
    status: Some(ConsoleElement::new("status")),
  }
}

/// Reloader that asks the session loop to start over.
pub struct ChannelReloader(pub mpsc::UnboundedSender<()>);

impl Reloader for ChannelReloader {
  fn reload(&self) {
    // The session may already be shutting down
    let _ = self.0.send(());
  }
}
