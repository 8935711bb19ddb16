//! Process signals as a cooperative shutdown request.
//!
//! Interrupt and terminate signals cancel a [`CancellationToken`]; the serving
//! loops watch that token and wind down on their own instead of the process
//! being killed.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A signal that asks the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  /// SIGINT - Interrupt signal
  Interrupt,
  /// SIGTERM - Termination signal
  Terminate,
}

impl Signal {
  /// Conventional signal name.
  pub fn name(&self) -> &'static str {
    match self {
      Signal::Interrupt => "SIGINT",
      Signal::Terminate => "SIGTERM",
    }
  }
}

/// Waits for the next interrupt or terminate signal.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
  use tokio::signal::unix::{SignalKind, signal};

  let mut sigint = signal(SignalKind::interrupt())?;
  let mut sigterm = signal(SignalKind::terminate())?;
  tokio::select! {
    _ = sigint.recv() => Ok(Signal::Interrupt),
    _ = sigterm.recv() => Ok(Signal::Terminate),
  }
}

/// Waits for the next interrupt (ctrl-c).
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
  tokio::signal::ctrl_c().await?;
  Ok(Signal::Interrupt)
}

/// Cancels `token` when a stop signal arrives.
///
/// The listener task ends after the first signal, or silently when the token
/// is cancelled by someone else first.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    tokio::select! {
      _ = token.cancelled() => {}
      received = wait_for_signal() => match received {
        Ok(signal) => {
          info!(signal = signal.name(), "Received signal. Stopping.");
          token.cancel();
        }
        Err(e) => warn!(error = %e, "Could not install signal handlers"),
      },
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_listener_ends_when_token_is_cancelled_elsewhere() {
    let token = CancellationToken::new();
    let listener = cancel_on_signal(token.clone());
    token.cancel();
    listener.await.unwrap();
  }

  #[test]
  fn test_signal_names() {
    assert_eq!(Signal::Interrupt.name(), "SIGINT");
    assert_eq!(Signal::Terminate.name(), "SIGTERM");
  }
}
