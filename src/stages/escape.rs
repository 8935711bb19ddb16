//! Wikipedia title escaping.
//!
//! `title_id` turns a page title into the percent-encoded form used in page
//! URLs; `title_slug` applies the lighter escaping used for dump slugs. Both
//! map a space to `_`. Non-string records pass through untouched.

use crate::error::StageError;
use crate::record::Record;
use crate::stage::{Emit, Stage};
use serde_json::Value;
use std::fmt::Write;

fn is_id_safe(byte: u8) -> bool {
  byte.is_ascii_alphanumeric() || b"*-._;/:@&=+$,()'!~".contains(&byte)
}

fn push_encoded(out: &mut String, byte: u8) {
  if byte == b' ' {
    out.push('_');
  } else {
    let _ = write!(out, "%{:02X}", byte);
  }
}

/// Percent-encodes every byte outside the URL-safe title set.
pub fn title_to_id(title: &str) -> String {
  let mut out = String::with_capacity(title.len());
  for &byte in title.as_bytes() {
    if is_id_safe(byte) {
      out.push(byte as char);
    } else {
      push_encoded(&mut out, byte);
    }
  }
  out
}

/// Unescapes `\"`, encodes `` ?`"%^`` and spaces, and encodes doubled
/// backslashes as `%5C`.
pub fn title_to_slug(title: &str) -> String {
  let unquoted = title.replace("\\\"", "\"");
  let mut out = String::with_capacity(unquoted.len());
  for ch in unquoted.chars() {
    match ch {
      ' ' | '?' | '`' | '"' | '%' | '^' => push_encoded(&mut out, ch as u8),
      _ => out.push(ch),
    }
  }
  out.replace("\\\\", "%5C")
}

/// Stage applying one of the title escapes to string records.
pub struct TitleEscape {
  name: &'static str,
  escape: fn(&str) -> String,
}

impl TitleEscape {
  /// The `title_id` stage.
  pub fn id() -> Self {
    Self {
      name: "title_id",
      escape: title_to_id,
    }
  }

  /// The `title_slug` stage.
  pub fn slug() -> Self {
    Self {
      name: "title_slug",
      escape: title_to_slug,
    }
  }
}

impl Stage for TitleEscape {
  fn name(&self) -> &str {
    self.name
  }

  fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
    match record {
      Value::String(title) => emit(Value::String((self.escape)(&title))),
      other => emit(other),
    }
  }
}
