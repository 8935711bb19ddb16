//! # Sequential Adapter
//!
//! [`StdioServer`] drives one dataflow from a single ordered line source,
//! usually stdin, and writes every output record as a line to a sink, usually
//! stdout.
//!
//! End of input, a read failure and a shutdown request all end the stream the
//! same way: the dataflow is finalized (finalize output is written like any
//! other output) and stopped. A stage failure ends the run with an error.

use crate::driver::{Driver, DriverStats};
use crate::error::ServerError;
use crate::record::{Record, to_chunk};
use crate::stage::Dataflow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options of the sequential adapter.
#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
  /// A line equal to this closes the current windows instead of being processed.
  pub flush_marker: Option<String>,
}

impl StdioConfig {
  /// Sets the flush marker.
  #[must_use]
  pub fn with_flush_marker(mut self, marker: Option<String>) -> Self {
    self.flush_marker = marker;
    self
  }
}

/// Runs a dataflow over one input stream.
pub struct StdioServer {
  driver: Driver,
  config: StdioConfig,
  shutdown: CancellationToken,
}

impl StdioServer {
  /// Creates a server owning `dataflow` for its whole lifetime.
  pub fn new(dataflow: Dataflow) -> Self {
    Self {
      driver: Driver::new(dataflow),
      config: StdioConfig::default(),
      shutdown: CancellationToken::new(),
    }
  }

  /// Sets the adapter options.
  #[must_use]
  pub fn with_config(mut self, config: StdioConfig) -> Self {
    self.config = config;
    self
  }

  /// Uses `token` as the shutdown request; cancelling it ends the input.
  #[must_use]
  pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
    self.shutdown = token;
    self
  }

  /// Reads `reader` to exhaustion, writing output to `writer`, then finalizes
  /// and stops the dataflow.
  pub async fn run<R, W>(mut self, reader: R, mut writer: W) -> Result<DriverStats, ServerError>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    self.driver.setup()?;
    let mut lines = reader.lines();
    loop {
      let line = tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => {
          info!("Shutdown requested, ending input");
          break;
        }
        next = lines.next_line() => match next {
          Ok(Some(line)) => line,
          Ok(None) => {
            debug!("End of input");
            break;
          }
          Err(e) => {
            debug!(error = %e, "Read failed, treating as end of input");
            break;
          }
        },
      };

      let output = if self.config.flush_marker.as_deref() == Some(line.as_str()) {
        self.driver.flush()?
      } else {
        self.driver.send_through_dataflow(&line)?
      };
      write_records(&mut writer, &output).await?;
    }

    let output = self.driver.finalize_and_stop()?;
    write_records(&mut writer, &output).await?;
    writer.flush().await?;
    Ok(self.driver.stats())
  }
}

async fn write_records<W>(writer: &mut W, records: &[Record]) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let chunk = to_chunk(records);
  if chunk.is_empty() {
    return Ok(());
  }
  writer.write_all(chunk.as_bytes()).await
}
