//! Helpers shared by unit tests.

use std::io;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.lock().unwrap().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// Runs `f` with a plain-text subscriber and returns its result and the logs.
pub(crate) fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
  let logs = CapturedLogs::default();
  let writer = logs.clone();
  let subscriber = tracing_subscriber::fmt()
    .with_ansi(false)
    .with_writer(move || writer.clone())
    .finish();
  let result = tracing::subscriber::with_default(subscriber, f);
  let text = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
  (result, text)
}
