//! # stagewise
//!
//! Line-oriented record pipelines with keyed grouping and online statistics.
//!
//! A pipeline is an ordered [`Dataflow`] of [`Stage`]s. A [`Driver`] pushes
//! each input line through the stages in order; stages may drop, pass or
//! expand records and may keep state between records. Grouping stages keep
//! one accumulator per key and emit their summaries when the pipeline is
//! finalized.
//!
//! Two adapters feed pipelines: [`StdioServer`](server::StdioServer) reads one
//! stream to exhaustion, [`TcpLineServer`](server::TcpLineServer) serves many
//! connections with one independent dataflow each.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use stagewise::stages::{FromJson, Moments};
//! use stagewise::{Dataflow, Driver};
//!
//! let settings = json!({"group_by": "k", "of": "a"}).as_object().cloned().unwrap();
//! let dataflow = Dataflow::new()
//!   .with_stage(FromJson::new())
//!   .with_stage(Moments::moments(&settings).unwrap());
//! let mut driver = Driver::new(dataflow);
//!
//! for line in [r#"{"k":"g","a":1}"#, r#"{"k":"g","a":3}"#] {
//!   assert!(driver.send_through_dataflow(line).unwrap().is_empty());
//! }
//! let summaries = driver.finalize_and_stop().unwrap();
//! assert_eq!(summaries[0]["results"]["a"]["mean"], json!(2.0));
//! ```

#![deny(missing_docs)]

/// Field extraction from records.
pub mod accessor;
/// Stage settings.
pub mod config;
/// Record routing through a dataflow.
pub mod driver;
/// Error types.
pub mod error;
/// Record type and line rendering.
pub mod record;
/// Named stages and pipelines.
pub mod registry;
/// Stdio and TCP adapters.
pub mod server;
/// The stage trait and dataflows.
pub mod stage;
/// Built-in stages.
pub mod stages;
#[cfg(test)]
mod test_support;

pub use driver::{Driver, DriverStats};
pub use error::{ConfigError, PipelineError, ServerError, StageError};
pub use record::Record;
pub use registry::{PipelineBuilder, PipelineRegistry, StageRegistry};
pub use stage::{Dataflow, DataflowFactory, Emit, Stage};
