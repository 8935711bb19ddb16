//! # Pipeline Registry
//!
//! Resolves a pipeline label into freshly built dataflows.
//!
//! - [`StageRegistry`] maps stage names to constructors taking [`Settings`].
//! - [`PipelineRegistry`] maps labels to ordered stage lists, loaded from a
//!   JSON pipelines file. A label that is not a known pipeline but names a
//!   registered stage resolves to a pipeline of that single stage.
//! - [`PipelineBuilder`] is a resolved pipeline plus global settings; it
//!   implements [`DataflowFactory`] so adapters can build one dataflow per
//!   connection.
//!
//! ## Pipelines file
//!
//! ```json
//! {
//!   "pipelines": {
//!     "latency": {
//!       "stages": [
//!         {"stage": "from_json"},
//!         {"stage": "moments", "group_by": "host", "of": "latency_ms"},
//!         {"stage": "to_json"}
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Every stage gets the global settings overlaid with its own entry's keys.

use crate::config::{Settings, merge};
use crate::error::ConfigError;
use crate::stage::{Dataflow, DataflowFactory, Stage};
use crate::stages::{FromJson, Group, Identity, Moments, TitleEscape, ToJson};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Constructs a stage from its settings.
pub type StageConstructor = fn(&Settings) -> Result<Box<dyn Stage>, ConfigError>;

/// Named stage constructors.
#[derive(Clone, Default)]
pub struct StageRegistry {
  constructors: BTreeMap<String, StageConstructor>,
}

impl StageRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a registry holding every built-in stage.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("identity", |_| Ok(Box::new(Identity)));
    registry.register("from_json", |_| Ok(Box::new(FromJson::new())));
    registry.register("to_json", |_| Ok(Box::new(ToJson)));
    registry.register("title_id", |_| Ok(Box::new(TitleEscape::id())));
    registry.register("title_slug", |_| Ok(Box::new(TitleEscape::slug())));
    registry.register("group", |settings| Ok(Box::new(Group::counting(settings)?)));
    registry.register("moments", |settings| Ok(Box::new(Moments::moments(settings)?)));
    registry
  }

  /// Registers (or replaces) a stage constructor.
  pub fn register(&mut self, name: impl Into<String>, constructor: StageConstructor) {
    self.constructors.insert(name.into(), constructor);
  }

  /// Whether a stage of that name is registered.
  pub fn contains(&self, name: &str) -> bool {
    self.constructors.contains_key(name)
  }

  /// Registered stage names, sorted.
  pub fn names(&self) -> Vec<&str> {
    self.constructors.keys().map(String::as_str).collect()
  }

  /// Builds a stage by name.
  pub fn build(&self, name: &str, settings: &Settings) -> Result<Box<dyn Stage>, ConfigError> {
    let constructor = self
      .constructors
      .get(name)
      .ok_or_else(|| ConfigError::UnknownStage(name.to_string()))?;
    constructor(settings)
  }
}

impl std::fmt::Debug for StageRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StageRegistry")
      .field("stages", &self.names())
      .finish()
  }
}

/// One stage of a pipeline description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageSpec {
  /// Registered stage name.
  pub stage: String,
  /// Stage-specific settings.
  #[serde(flatten)]
  pub settings: Settings,
}

impl StageSpec {
  /// A stage without settings of its own.
  pub fn named(stage: impl Into<String>) -> Self {
    Self {
      stage: stage.into(),
      settings: Settings::new(),
    }
  }
}

/// An ordered list of stages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PipelineSpec {
  /// Stages in execution order.
  #[serde(default)]
  pub stages: Vec<StageSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineFile {
  #[serde(default)]
  pipelines: BTreeMap<String, PipelineSpec>,
}

/// Named pipelines over a stage registry.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
  stages: Arc<StageRegistry>,
  pipelines: BTreeMap<String, PipelineSpec>,
}

impl Default for PipelineRegistry {
  fn default() -> Self {
    Self::new(StageRegistry::with_builtins())
  }
}

impl PipelineRegistry {
  /// A registry without named pipelines.
  pub fn new(stages: StageRegistry) -> Self {
    Self {
      stages: Arc::new(stages),
      pipelines: BTreeMap::new(),
    }
  }

  /// Adds the pipelines described by a JSON document.
  pub fn load_str(mut self, json: &str) -> Result<Self, ConfigError> {
    let file: PipelineFile = serde_json::from_str(json)?;
    self.pipelines.extend(file.pipelines);
    Ok(self)
  }

  /// Adds the pipelines described by a JSON file.
  pub fn load_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)?;
    let registry = self.load_str(&json)?;
    info!(
      path = %path.display(),
      pipelines = registry.pipelines.len(),
      "Loaded pipelines file"
    );
    Ok(registry)
  }

  /// Registers a pipeline under `label`.
  pub fn insert(&mut self, label: impl Into<String>, spec: PipelineSpec) {
    self.pipelines.insert(label.into(), spec);
  }

  /// Resolves a label to its stage list.
  pub fn retrieve(&self, label: &str) -> Result<PipelineSpec, ConfigError> {
    if let Some(spec) = self.pipelines.get(label) {
      return Ok(spec.clone());
    }
    if self.stages.contains(label) {
      return Ok(PipelineSpec {
        stages: vec![StageSpec::named(label)],
      });
    }
    Err(ConfigError::UnknownPipeline(label.to_string()))
  }

  /// Resolves a label and checks that its dataflow can be built with
  /// `settings`, so configuration errors surface before serving starts.
  pub fn builder(&self, label: &str, settings: Settings) -> Result<PipelineBuilder, ConfigError> {
    let builder = PipelineBuilder {
      label: label.to_string(),
      stages: Arc::clone(&self.stages),
      spec: self.retrieve(label)?,
      settings,
    };
    builder.build()?;
    Ok(builder)
  }
}

/// A resolved pipeline that builds independent dataflows.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
  label: String,
  stages: Arc<StageRegistry>,
  spec: PipelineSpec,
  settings: Settings,
}

impl PipelineBuilder {
  /// The label the pipeline was resolved from.
  pub fn label(&self) -> &str {
    &self.label
  }
}

impl DataflowFactory for PipelineBuilder {
  fn build(&self) -> Result<Dataflow, ConfigError> {
    let mut dataflow = Dataflow::new();
    for spec in &self.spec.stages {
      let settings = merge(&self.settings, &spec.settings);
      dataflow.push(self.stages.build(&spec.stage, &settings)?);
    }
    debug!(pipeline = %self.label, stages = ?dataflow.names(), "Built dataflow");
    Ok(dataflow)
  }
}
