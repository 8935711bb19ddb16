//! # Stage Trait
//!
//! A [`Stage`] is one step of a pipeline. Stages are driven through a fixed
//! lifecycle by the [`Driver`](crate::driver::Driver):
//!
//! ```text
//! setup() -> process(record, emit)* -> finalize(emit) -> stop()
//! ```
//!
//! Every capability has a default: `process` passes the record through, the
//! others do nothing. A stage may emit zero, one or many records per input via
//! the `emit` callback, and may hold arbitrary state between calls for as long
//! as it lives in its [`Dataflow`].

use crate::error::{ConfigError, StageError};
use crate::record::Record;

/// Callback through which a stage hands records to the rest of the pipeline.
pub type Emit<'a> = dyn FnMut(Record) -> Result<(), StageError> + 'a;

/// One step of a pipeline.
pub trait Stage: Send {
  /// Name used in logs and errors.
  fn name(&self) -> &str;

  /// Called once before the first record reaches this stage.
  fn setup(&mut self) -> Result<(), StageError> {
    Ok(())
  }

  /// Handles one record, emitting zero or more records.
  fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
    emit(record)
  }

  /// Closes the current window, emitting any buffered results.
  fn finalize(&mut self, _emit: &mut Emit<'_>) -> Result<(), StageError> {
    Ok(())
  }

  /// Releases resources once the dataflow is done.
  fn stop(&mut self) -> Result<(), StageError> {
    Ok(())
  }
}

/// An ordered chain of stages, owned by exactly one driver.
#[derive(Default)]
pub struct Dataflow {
  stages: Vec<Box<dyn Stage>>,
}

impl Dataflow {
  /// Creates an empty dataflow. Records pass through it unchanged.
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a stage, builder style.
  #[must_use]
  pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
    self.stages.push(Box::new(stage));
    self
  }

  /// Appends an already boxed stage.
  pub fn push(&mut self, stage: Box<dyn Stage>) {
    self.stages.push(stage);
  }

  /// Number of stages.
  pub fn len(&self) -> usize {
    self.stages.len()
  }

  /// Whether the dataflow has no stages.
  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  /// Stage names in execution order.
  pub fn names(&self) -> Vec<String> {
    self.stages.iter().map(|s| s.name().to_string()).collect()
  }

  pub(crate) fn stages_mut(&mut self) -> &mut [Box<dyn Stage>] {
    &mut self.stages
  }
}

impl From<Vec<Box<dyn Stage>>> for Dataflow {
  fn from(stages: Vec<Box<dyn Stage>>) -> Self {
    Self { stages }
  }
}

impl std::fmt::Debug for Dataflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dataflow")
      .field("stages", &self.names())
      .finish()
  }
}

/// Builds fresh, independent dataflows on demand.
///
/// The TCP adapter calls this once per connection so that no two connections
/// ever share stage state.
pub trait DataflowFactory: Send + Sync {
  /// Builds a new dataflow.
  fn build(&self) -> Result<Dataflow, ConfigError>;
}

impl<F> DataflowFactory for F
where
  F: Fn() -> Result<Dataflow, ConfigError> + Send + Sync,
{
  fn build(&self) -> Result<Dataflow, ConfigError> {
    self()
  }
}
