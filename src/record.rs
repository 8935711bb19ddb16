//! Records and their line representation.
//!
//! A record is a [`serde_json::Value`]. Raw input lines enter the pipeline as
//! string values; stages are free to turn them into structured values. On the
//! way out, string records are written verbatim and everything else as compact
//! JSON, one record per line.

use serde_json::Value;

/// A record flowing through a dataflow.
pub type Record = Value;

/// Wraps a raw input line as a record.
pub fn from_line(line: &str) -> Record {
  Value::String(line.to_string())
}

/// Renders a record as a single output line (without the trailing newline).
pub fn to_line(record: &Record) -> String {
  match record {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// Renders a batch of records as one newline-terminated chunk.
///
/// Returns an empty string for an empty batch so callers can skip the write.
pub fn to_chunk(records: &[Record]) -> String {
  if records.is_empty() {
    return String::new();
  }
  let mut chunk = records.iter().map(to_line).collect::<Vec<_>>().join("\n");
  chunk.push('\n');
  chunk
}

/// Renders the reply to one request line.
///
/// Like [`to_chunk`], except that an empty batch is answered with an empty
/// line, so every request line gets exactly one reply.
pub fn to_reply(records: &[Record]) -> String {
  if records.is_empty() {
    return "\n".to_string();
  }
  to_chunk(records)
}
