//! # TCP Line Server
//!
//! [`TcpLineServer`] accepts connections and gives each one its own freshly
//! built dataflow. Nothing is shared between connections except the factory
//! the dataflows are built from.
//!
//! ## Per-connection flow
//!
//! ```text
//! socket --lines--> reader task --channel--> blocking worker (owns Driver)
//!                                                  |
//! socket <--one write per record batch-- writer task <--channel--
//! ```
//!
//! Stage work runs on the blocking pool so slow stages never stall the
//! executor threads serving other connections. Each received line, the flush
//! marker included, is answered with exactly one batch, written with a single
//! `write_all` as the records joined by newlines. A line that produces no
//! records is answered with an empty line.
//!
//! ## Ordering
//!
//! One worker consumes each connection's lines from a FIFO channel, so records
//! are processed, and their batches written, strictly in the order they were
//! received. There is no ordering between connections.
//!
//! ## Closing
//!
//! When the client closes its side the dataflow is dropped without being
//! finalized, unless [`TcpServerConfig::finalize_on_close`] is set; then the
//! finalize output is written before the server closes its side. A stage
//! failure closes that connection only.

use crate::driver::Driver;
use crate::error::{PipelineError, ServerError};
use crate::record::{to_chunk, to_reply};
use crate::stage::DataflowFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the TCP server.
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
  /// Address to bind to (default: "127.0.0.1:9000").
  pub bind_address: String,
  /// Lines buffered per connection before reading pauses (default: 64).
  pub max_in_flight: usize,
  /// A line equal to this closes the connection's current windows and writes
  /// their summaries.
  pub flush_marker: Option<String>,
  /// Finalize the connection's dataflow when the client closes its side.
  pub finalize_on_close: bool,
}

impl Default for TcpServerConfig {
  fn default() -> Self {
    Self {
      bind_address: "127.0.0.1:9000".to_string(),
      max_in_flight: 64,
      flush_marker: None,
      finalize_on_close: false,
    }
  }
}

impl TcpServerConfig {
  /// Sets the bind address.
  #[must_use]
  pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
    self.bind_address = address.into();
    self
  }

  /// Sets the per-connection line buffer.
  #[must_use]
  pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
    self.max_in_flight = max_in_flight;
    self
  }

  /// Sets the flush marker line.
  #[must_use]
  pub fn with_flush_marker(mut self, marker: Option<String>) -> Self {
    self.flush_marker = marker;
    self
  }

  /// Sets whether dataflows are finalized when clients close.
  #[must_use]
  pub fn with_finalize_on_close(mut self, finalize_on_close: bool) -> Self {
    self.finalize_on_close = finalize_on_close;
    self
  }
}

/// Serves one dataflow per TCP connection.
pub struct TcpLineServer {
  factory: Arc<dyn DataflowFactory>,
  config: TcpServerConfig,
  shutdown: CancellationToken,
}

impl TcpLineServer {
  /// Creates a server building each connection's dataflow from `factory`.
  pub fn new(factory: impl DataflowFactory + 'static, config: TcpServerConfig) -> Self {
    Self {
      factory: Arc::new(factory),
      config,
      shutdown: CancellationToken::new(),
    }
  }

  /// Uses `token` as the stop request.
  #[must_use]
  pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
    self.shutdown = token;
    self
  }

  /// Token whose cancellation stops the serving loop.
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Asks the serving loop to stop accepting and return.
  pub fn request_stop(&self) {
    self.shutdown.cancel();
  }

  /// Binds the configured address.
  pub async fn bind(&self) -> Result<TcpListener, ServerError> {
    TcpListener::bind(&self.config.bind_address)
      .await
      .map_err(|source| ServerError::Bind {
        address: self.config.bind_address.clone(),
        source,
      })
  }

  /// Binds the configured address and serves until stopped.
  pub async fn start(&self) -> Result<(), ServerError> {
    let listener = self.bind().await?;
    self.serve(listener).await
  }

  /// Serves connections from `listener` until a stop is requested.
  ///
  /// Open connections are dropped when the loop stops; they are not drained.
  pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
    let address = listener.local_addr()?;
    info!(address = %address, "TCP server listening");

    let mut connections = JoinSet::new();
    loop {
      tokio::select! {
        _ = self.shutdown.cancelled() => {
          info!(
            address = %address,
            open_connections = connections.len(),
            "Stop requested, no longer accepting connections"
          );
          break;
        }
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            info!(peer = %peer, "Accepted TCP connection");
            let factory = Arc::clone(&self.factory);
            let config = self.config.clone();
            connections.spawn(async move {
              match handle_connection(stream, peer, factory.as_ref(), &config).await {
                Ok(()) => info!(peer = %peer, "Connection closed"),
                Err(e) => error!(peer = %peer, error = %e, "Error handling TCP connection"),
              }
            });
          }
          Err(e) => warn!(error = %e, "Error accepting TCP connection"),
        },
        Some(_) = connections.join_next(), if !connections.is_empty() => {}
      }
    }
    Ok(())
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  factory: &dyn DataflowFactory,
  config: &TcpServerConfig,
) -> Result<(), ServerError> {
  let driver = Driver::new(factory.build()?);
  let (read_half, write_half) = stream.into_split();
  let capacity = config.max_in_flight.max(1);
  let (line_tx, line_rx) = mpsc::channel::<String>(capacity);
  let (batch_tx, batch_rx) = mpsc::channel::<String>(capacity);

  let worker_config = config.clone();
  let worker =
    tokio::task::spawn_blocking(move || run_worker(driver, line_rx, batch_tx, &worker_config));
  let writer = tokio::spawn(write_batches(write_half, batch_rx));

  let mut lines = BufReader::new(read_half).lines();
  loop {
    // The worker closes its end when a stage fails.
    let next = tokio::select! {
      _ = line_tx.closed() => {
        debug!(peer = %peer, "Worker gone, no longer reading");
        break;
      }
      next = lines.next_line() => next,
    };
    match next {
      Ok(Some(line)) => {
        if line_tx.send(line).await.is_err() {
          debug!(peer = %peer, "Worker gone, no longer reading");
          break;
        }
      }
      Ok(None) => break,
      Err(e) => {
        debug!(peer = %peer, error = %e, "Read failed, closing connection");
        break;
      }
    }
  }
  drop(line_tx);

  let processed = worker.await.map_err(std::io::Error::other)?;
  let written = writer.await.map_err(std::io::Error::other)?;
  processed?;
  written?;
  Ok(())
}

/// Feeds received lines through the driver, in order, on a blocking thread.
fn run_worker(
  mut driver: Driver,
  mut lines: mpsc::Receiver<String>,
  batches: mpsc::Sender<String>,
  config: &TcpServerConfig,
) -> Result<(), PipelineError> {
  while let Some(line) = lines.blocking_recv() {
    let output = if config.flush_marker.as_deref() == Some(line.as_str()) {
      driver.flush()?
    } else {
      driver.send_through_dataflow(&line)?
    };
    if batches.blocking_send(to_reply(&output)).is_err() {
      debug!("Writer gone, dropping dataflow");
      return Ok(());
    }
  }
  if config.finalize_on_close {
    let chunk = to_chunk(&driver.finalize_and_stop()?);
    if !chunk.is_empty()
      && let Err(e) = batches.blocking_send(chunk)
    {
      warn!(bytes = e.0.len(), "Writer gone, finalize output not delivered");
    }
  }
  Ok(())
}

/// Writes each batch with a single write, then closes the write side.
async fn write_batches(
  mut write_half: OwnedWriteHalf,
  mut batches: mpsc::Receiver<String>,
) -> std::io::Result<()> {
  while let Some(chunk) = batches.recv().await {
    write_half.write_all(chunk.as_bytes()).await?;
    write_half.flush().await?;
  }
  write_half.shutdown().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ConfigError, StageError};
  use crate::record::Record;
  use crate::stage::{Dataflow, Emit, Stage};
  use crate::test_support::with_captured_logs;
  use serde_json::json;
  use std::time::Duration;
  use tokio::io::AsyncReadExt;
  use tokio::time::timeout;

  struct RejectBad;

  impl Stage for RejectBad {
    fn name(&self) -> &str {
      "reject_bad"
    }

    fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
      if record == json!("bad") {
        return Err(StageError::Other("rejected".to_string()));
      }
      emit(record)
    }
  }

  fn rejecting_dataflow() -> Result<Dataflow, ConfigError> {
    Ok(Dataflow::new().with_stage(RejectBad))
  }

  #[tokio::test]
  async fn test_stage_failure_closes_connection_while_client_stays_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (stream, peer) = listener.accept().await.unwrap();

    // The client keeps its write side open for the whole test.
    client.write_all(b"ok\nbad\n").await.unwrap();
    let handled = timeout(
      Duration::from_secs(5),
      handle_connection(stream, peer, &rejecting_dataflow, &TcpServerConfig::default()),
    )
    .await
    .unwrap();
    assert!(matches!(
      handled,
      Err(ServerError::Pipeline(PipelineError::Stage { index: 0, .. }))
    ));

    let mut output = String::new();
    timeout(Duration::from_secs(5), client.read_to_string(&mut output))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(output, "ok\n");
  }

  // Emits one summary when finalized.
  struct Closing;

  impl Stage for Closing {
    fn name(&self) -> &str {
      "closing"
    }

    fn finalize(&mut self, emit: &mut Emit<'_>) -> Result<(), StageError> {
      emit(json!("summary"))
    }
  }

  #[test]
  fn test_undelivered_finalize_output_is_logged() {
    let (line_tx, line_rx) = mpsc::channel::<String>(1);
    let (batch_tx, batch_rx) = mpsc::channel::<String>(1);
    drop(line_tx);
    drop(batch_rx);
    let config = TcpServerConfig::default().with_finalize_on_close(true);
    let driver = Driver::new(Dataflow::new().with_stage(Closing));

    let (result, logs) = with_captured_logs(|| run_worker(driver, line_rx, batch_tx, &config));
    assert!(result.is_ok());
    assert!(logs.contains("finalize output not delivered"), "logs were: {}", logs);
    assert!(logs.contains("bytes=8"), "logs were: {}", logs);
  }
}
