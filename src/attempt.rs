//! Explicit "attempt, discard failure" helper for optional features.

use std::fmt::Display;

/// Run a fallible step whose failure is deliberately ignored.
///
/// The error is logged at debug level and dropped; callers get `None`.
pub fn best_effort<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
  match result {
    Ok(value) => Some(value),
    Err(e) => {
      tracing::debug!(error = %e, "{} failed; ignoring", what);
      None
    }
  }
}
