//! Messages the page may post to a worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed view of a posted message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Activate now instead of waiting for controlled pages to go away
  SkipWaiting,
}

impl WorkerMessage {
  /// Decode a posted message. Anything unrecognised yields `None`.
  pub fn parse(data: &Value) -> Option<Self> {
    serde_json::from_value(data.clone()).ok()
  }

  pub fn to_value(&self) -> Value {
    // Unit variants of an internally tagged enum always serialize
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}
