use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Session input events
#[derive(Debug)]
pub enum Event {
  /// One line typed at the prompt
  Line(String),
  /// Ctrl-C
  Interrupt,
  /// Stdin reached end of input
  Closed,
}

/// Event handler that produces events from stdin lines and Ctrl-C.
///
/// Lives for the whole process so a page reload does not lose typed input.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    let lines_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if lines_tx.send(Event::Line(line)).is_err() {
              break;
            }
          }
          Ok(None) => break,
          Err(e) => {
            tracing::warn!(error = %e, "stdin read failed");
            break;
          }
        }
      }
      let _ = lines_tx.send(Event::Closed);
    });

    // Spawn interrupt listener
    tokio::spawn(async move {
      while tokio::signal::ctrl_c().await.is_ok() {
        if tx.send(Event::Interrupt).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
