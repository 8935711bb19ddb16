//! # Error Types
//!
//! Error taxonomy for stagewise pipelines.
//!
//! - **[`ConfigError`]**: a pipeline could not be instantiated (missing key path,
//!   unknown stage or pipeline, unreadable pipelines file). Fatal to that
//!   instantiation.
//! - **[`StageError`]**: a stage failed while handling a record. Never caught by
//!   the driver.
//! - **[`PipelineError`]**: a stage error annotated with the stage that raised it.
//! - **[`ServerError`]**: failures of the stdio and TCP adapters.
//!
//! Per-record extraction problems (absent fields, non-numeric values) are not
//! errors at all; the accessors return `Option` and callers skip the value.

use std::io;
use thiserror::Error;

/// Error raised while turning configuration into a dataflow.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// A stage needs a key path and neither `group_by` nor `by` was given.
  #[error("stage `{stage}` requires a `group_by` (or legacy `by`) setting")]
  MissingKey {
    /// Name of the stage being constructed.
    stage: String,
  },
  /// A stage description names a stage kind that is not registered.
  #[error("unknown stage `{0}`")]
  UnknownStage(String),
  /// The label resolves neither to a pipeline nor to a built-in stage.
  #[error("unknown pipeline `{0}`")]
  UnknownPipeline(String),
  /// A settings value has a shape that cannot be used at all.
  #[error("invalid settings: {0}")]
  InvalidSettings(String),
  /// The pipelines file could not be read.
  #[error("failed to read pipelines file: {0}")]
  Io(#[from] io::Error),
  /// The pipelines file is not valid JSON for a registry.
  #[error("failed to parse pipelines file: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Error raised by a stage while processing or finalizing.
#[derive(Error, Debug)]
pub enum StageError {
  /// A record could not be parsed by a stage that requires it.
  #[error("parse error: {0}")]
  Parse(String),
  /// A record could not be serialized.
  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),
  /// Any other stage-internal failure.
  #[error("{0}")]
  Other(String),
}

/// Error surfaced by the driver.
#[derive(Error, Debug)]
pub enum PipelineError {
  /// A stage failed; the driver does not retry.
  #[error("stage `{stage}` (#{index}) failed: {source}")]
  Stage {
    /// Name of the failing stage.
    stage: String,
    /// Position of the failing stage in the dataflow.
    index: usize,
    /// The underlying stage error.
    #[source]
    source: StageError,
  },
  /// The dataflow could not be built.
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// A record arrived after the dataflow was stopped.
  #[error("dataflow has already been stopped")]
  Stopped,
}

/// Error surfaced by the stdio and TCP adapters.
#[derive(Error, Debug)]
pub enum ServerError {
  /// The listener could not be bound.
  #[error("failed to bind to {address}: {source}")]
  Bind {
    /// Address that was requested.
    address: String,
    /// Underlying I/O error.
    #[source]
    source: io::Error,
  },
  /// Writing to the sink or connection failed.
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
  /// Processing a record failed.
  #[error(transparent)]
  Pipeline(#[from] PipelineError),
  /// A per-connection dataflow could not be built.
  #[error(transparent)]
  Config(#[from] ConfigError),
}
