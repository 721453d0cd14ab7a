//! Cloze cards and their local-storage persistence.

mod parse;

pub use parse::{parse, ParseError, BLANK};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::Database;

/// Local-storage key holding the JSON array of cards.
pub const STORAGE_KEY: &str = "cloze_cards";

/// One flashcard, stored as written by the web app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
  pub id: String,
  /// Text as the user typed it
  pub raw: String,
  pub question: String,
  pub answers: Vec<String>,
  /// Milliseconds since the Unix epoch
  pub created_at: i64,
}

impl Card {
  /// Author a card from raw text in either input mode.
  pub fn from_raw(raw: &str) -> Result<Self, ParseError> {
    let cloze = parse(raw)?;
    let created_at = Utc::now().timestamp_millis();

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.update(created_at.to_le_bytes());
    let id = hex::encode(&hasher.finalize()[..8]);

    Ok(Self {
      id,
      raw: raw.trim().to_string(),
      question: cloze.question,
      answers: cloze.answers,
      created_at,
    })
  }
}

/// Cards persisted under [`STORAGE_KEY`].
#[derive(Clone)]
pub struct CardStore {
  db: Arc<Database>,
}

impl CardStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// All cards, oldest first. Unreadable data counts as no cards.
  pub fn list(&self) -> Result<Vec<Card>> {
    let Some(data) = self.db.get_item(STORAGE_KEY)? else {
      return Ok(Vec::new());
    };

    match serde_json::from_str(&data) {
      Ok(cards) => Ok(cards),
      Err(e) => {
        tracing::warn!(error = %e, "stored cards are unreadable; starting empty");
        Ok(Vec::new())
      }
    }
  }

  fn save(&self, cards: &[Card]) -> Result<()> {
    let data = serde_json::to_string(cards).map_err(|e| eyre!("Failed to serialize cards: {}", e))?;
    self.db.set_item(STORAGE_KEY, &data)
  }

  /// Parse and append a card.
  pub fn add(&self, raw: &str) -> Result<Card> {
    let card = Card::from_raw(raw)?;
    let mut cards = self.list()?;
    cards.push(card.clone());
    self.save(&cards)?;
    Ok(card)
  }

  /// Remove a card by id. Returns false if no card had that id.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut cards = self.list()?;
    let before = cards.len();
    cards.retain(|card| card.id != id);
    if cards.len() == before {
      return Ok(false);
    }
    self.save(&cards)?;
    Ok(true)
  }
}
