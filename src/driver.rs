//! # Driver
//!
//! The [`Driver`] owns one [`Dataflow`] and pushes records through it.
//!
//! For each incoming line the candidate set starts as the single raw record.
//! Every stage turns each candidate into zero or more outputs and the
//! concatenation, in order, becomes the input of the next stage. What falls
//! out of the last stage is returned to the caller.
//!
//! Stages are set up lazily, once, before the first record. Stage failures are
//! returned as they happen, annotated with the stage name and position; the
//! driver never retries.
//!
//! Finalization cascades: a record emitted by stage `i` while finalizing is
//! routed through stages `i + 1..`, which are finalized afterwards, so a
//! summary produced by a group can still be reshaped by later stages.

use crate::error::{PipelineError, StageError};
use crate::record::{self, Record};
use crate::stage::{Dataflow, Stage};
use tracing::{debug, info};

/// Throughput counters of a driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
  /// Raw records received.
  pub records_in: u64,
  /// Records that fell out of the last stage, including finalize output.
  pub records_out: u64,
}

/// Routes records through a dataflow.
#[derive(Debug)]
pub struct Driver {
  dataflow: Dataflow,
  set_up: bool,
  stopped: bool,
  stats: DriverStats,
}

impl Driver {
  /// Binds a driver to a dataflow.
  pub fn new(dataflow: Dataflow) -> Self {
    Self {
      dataflow,
      set_up: false,
      stopped: false,
      stats: DriverStats::default(),
    }
  }

  /// The dataflow this driver routes through.
  pub fn dataflow(&self) -> &Dataflow {
    &self.dataflow
  }

  /// Throughput counters so far.
  pub fn stats(&self) -> DriverStats {
    self.stats
  }

  /// Whether `finalize_and_stop` has completed.
  pub fn is_stopped(&self) -> bool {
    self.stopped
  }

  /// Calls `setup` on every stage, once per dataflow.
  pub fn setup(&mut self) -> Result<(), PipelineError> {
    if self.set_up {
      return Ok(());
    }
    for (index, stage) in self.dataflow.stages_mut().iter_mut().enumerate() {
      if let Err(source) = stage.setup() {
        return Err(stage_failure(stage.as_ref(), index, source));
      }
    }
    self.set_up = true;
    debug!(stages = ?self.dataflow.names(), "Dataflow set up");
    Ok(())
  }

  /// Pushes one raw line through every stage and returns the output records.
  pub fn send_through_dataflow(&mut self, raw: &str) -> Result<Vec<Record>, PipelineError> {
    if self.stopped {
      return Err(PipelineError::Stopped);
    }
    self.setup()?;
    self.stats.records_in += 1;
    let output = self.advance(0, record::from_line(raw))?;
    self.stats.records_out += output.len() as u64;
    Ok(output)
  }

  /// Routes `record` through the stages starting at position `index`.
  ///
  /// An index past the end returns the record unchanged.
  pub fn advance(&mut self, index: usize, record: Record) -> Result<Vec<Record>, PipelineError> {
    let stages = self.dataflow.stages_mut();
    let index = index.min(stages.len());
    run_chain(&mut stages[index..], index, record)
  }

  /// Closes the current window of every stage.
  ///
  /// Stages are finalized in order. Records a stage emits while finalizing are
  /// routed through the stages after it before those are finalized in turn.
  pub fn flush(&mut self) -> Result<Vec<Record>, PipelineError> {
    if self.stopped {
      return Ok(Vec::new());
    }
    self.setup()?;
    let stages = self.dataflow.stages_mut();
    let mut output = Vec::new();
    for index in 0..stages.len() {
      let (head, tail) = stages.split_at_mut(index + 1);
      let stage = &mut head[index];
      let mut downstream_error = None;
      let result = stage.finalize(&mut |record| match run_chain(tail, index + 1, record) {
        Ok(records) => {
          output.extend(records);
          Ok(())
        }
        Err(e) => {
          let message = e.to_string();
          downstream_error = Some(e);
          Err(StageError::Other(message))
        }
      });
      if let Some(e) = downstream_error {
        return Err(e);
      }
      if let Err(source) = result {
        return Err(stage_failure(stage.as_ref(), index, source));
      }
    }
    self.stats.records_out += output.len() as u64;
    Ok(output)
  }

  /// Finalizes every stage, then stops every stage in order.
  ///
  /// Calling it again after it succeeded returns no records.
  pub fn finalize_and_stop(&mut self) -> Result<Vec<Record>, PipelineError> {
    if self.stopped {
      return Ok(Vec::new());
    }
    let output = self.flush()?;
    for (index, stage) in self.dataflow.stages_mut().iter_mut().enumerate() {
      if let Err(source) = stage.stop() {
        return Err(stage_failure(stage.as_ref(), index, source));
      }
    }
    self.stopped = true;
    info!(
      records_in = self.stats.records_in,
      records_out = self.stats.records_out,
      "Dataflow finalized and stopped"
    );
    Ok(output)
  }
}

/// Runs `record` through `stages`, whose first element sits at `offset`.
fn run_chain(
  stages: &mut [Box<dyn Stage>],
  offset: usize,
  record: Record,
) -> Result<Vec<Record>, PipelineError> {
  let mut candidates = vec![record];
  for (position, stage) in stages.iter_mut().enumerate() {
    if candidates.is_empty() {
      break;
    }
    let mut next = Vec::with_capacity(candidates.len());
    for candidate in candidates {
      let result = stage.process(candidate, &mut |out| {
        next.push(out);
        Ok(())
      });
      if let Err(source) = result {
        return Err(stage_failure(stage.as_ref(), offset + position, source));
      }
    }
    candidates = next;
  }
  Ok(candidates)
}

fn stage_failure(stage: &dyn Stage, index: usize, source: StageError) -> PipelineError {
  PipelineError::Stage {
    stage: stage.name().to_string(),
    index,
    source,
  }
}
