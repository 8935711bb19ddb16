//! JSON conversion stages.
//!
//! `from_json` parses raw lines into structured records; lines that are not
//! valid JSON are dropped with a warning. `to_json` renders structured records
//! back into JSON text; string records are already lines and pass through.

use crate::error::StageError;
use crate::record::Record;
use crate::stage::{Emit, Stage};
use serde_json::Value;
use tracing::warn;

/// Parses string records as JSON.
#[derive(Debug, Default)]
pub struct FromJson {
  dropped: u64,
}

impl FromJson {
  /// Creates the stage.
  pub fn new() -> Self {
    Self::default()
  }

  /// Lines dropped because they were not valid JSON.
  pub fn dropped(&self) -> u64 {
    self.dropped
  }
}

impl Stage for FromJson {
  fn name(&self) -> &str {
    "from_json"
  }

  fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
    let Value::String(raw) = record else {
      return emit(record);
    };
    match serde_json::from_str::<Value>(&raw) {
      Ok(parsed) => emit(parsed),
      Err(e) => {
        self.dropped += 1;
        warn!(error = %e, line = %raw, "Dropping line that is not valid JSON");
        Ok(())
      }
    }
  }

  fn stop(&mut self) -> Result<(), StageError> {
    if self.dropped > 0 {
      warn!(dropped = self.dropped, "Lines dropped by from_json");
    }
    Ok(())
  }
}

/// Serializes structured records to JSON text.
#[derive(Debug, Default)]
pub struct ToJson;

impl Stage for ToJson {
  fn name(&self) -> &str {
    "to_json"
  }

  fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
    match record {
      Value::String(_) => emit(record),
      other => emit(Value::String(serde_json::to_string(&other)?)),
    }
  }
}
