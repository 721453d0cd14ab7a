mod attempt;
mod cache;
mod cards;
mod commands;
mod config;
mod db;
mod event;
mod host;
mod logging;
mod net;
mod session;
mod update;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::cards::CardStore;
use crate::config::{Config, ConfigScriptSource};
use crate::db::Database;
use crate::event::EventHandler;
use crate::net::HttpNetwork;
use crate::session::Session;

#[derive(Parser, Debug)]
#[command(name = "clozeshell")]
#[command(about = "Offline shell and update lifecycle for a cloze flashcard app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clozeshell/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Run as if the host had no worker support
  #[arg(long, global = true)]
  no_worker: bool,

  #[command(subcommand)]
  action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
  /// Interactive session (default)
  Run,
  /// Manage flashcards
  Cards {
    #[command(subcommand)]
    action: CardsAction,
  },
  /// Inspect the offline cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CardsAction {
  /// Add a card: `The {{term}} ...` or `sentence | answer; answer`
  Add { raw: String },
  List,
  Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Cache generations and their entry counts
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  match args.action.unwrap_or(Action::Run) {
    Action::Run => run(args.config, !args.no_worker).await,
    Action::Cards { action } => manage_cards(action),
    Action::Cache {
      action: CacheAction::List,
    } => {
      let storage = SqliteStorage::open()?;
      for generation in storage.generations()? {
        println!("{}\t{} entries", generation.name, generation.entries);
      }
      Ok(())
    }
  }
}

async fn run(config_path: Option<PathBuf>, worker_support: bool) -> Result<()> {
  // Load configuration
  let path = Config::locate(config_path.as_deref())?;
  let config = Config::from_path(&path)?;
  tracing::info!(config = %path.display(), origin = %config.origin, "starting session");

  let session = Session {
    origin: config.origin.clone(),
    script: config.worker.script(),
    options: config.update.options(),
    storage: Arc::new(SqliteStorage::open()?),
    network: Arc::new(HttpNetwork::new(config.worker.fetch_timeout())?),
    registrations: Arc::new(Database::open()?),
    source: Arc::new(ConfigScriptSource::new(path)),
    worker_support,
  };

  let mut events = EventHandler::new();
  session.run(&mut events).await
}

fn manage_cards(action: CardsAction) -> Result<()> {
  let store = CardStore::new(Arc::new(Database::open()?));

  match action {
    CardsAction::Add { raw } => {
      let card = store.add(&raw)?;
      println!("{}\t{}", card.id, card.question);
    }
    CardsAction::List => {
      for card in store.list()? {
        println!("{}\t{}\t[{}]", card.id, card.question, card.answers.join("; "));
      }
    }
    CardsAction::Remove { id } => {
      if store.remove(&id)? {
        println!("removed {}", id);
      } else {
        println!("no card with id {}", id);
      }
    }
  }

  Ok(())
}
