//! Field extraction from records.
//!
//! Stages that look inside records (grouping, measuring) go through the
//! [`FieldAccessor`] trait rather than poking at JSON directly. Extraction never
//! fails: an absent field, a path through a scalar, or an unparseable raw line
//! all yield `None`.

use crate::record::Record;
use serde_json::Value;
use std::borrow::Cow;

/// Looks up a value inside a record by path.
pub trait FieldAccessor: Send + Sync {
  /// Returns the value at `path`, or `None` when the record has no such field.
  fn extract(&self, record: &Record, path: &str) -> Option<Value>;
}

/// Dotted-path accessor: `user.address.city`, `items.0.price`.
///
/// Object members are addressed by name and array elements by index. Raw
/// string records holding a JSON document are parsed before the lookup. An
/// empty path addresses the whole record.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathAccessor;

impl FieldAccessor for PathAccessor {
  fn extract(&self, record: &Record, path: &str) -> Option<Value> {
    let record = structured(record);
    if path.is_empty() {
      return Some(record.into_owned());
    }
    let mut current: &Value = &record;
    for segment in path.split('.') {
      current = match current {
        Value::Object(map) => map.get(segment)?,
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
        _ => return None,
      };
    }
    Some(current.clone())
  }
}

/// Returns the structured form of a record.
///
/// String records that parse as a JSON object or array are parsed; anything
/// else is returned as is.
pub fn structured(record: &Record) -> Cow<'_, Value> {
  if let Value::String(raw) = record
    && let Ok(parsed) = serde_json::from_str::<Value>(raw)
    && (parsed.is_object() || parsed.is_array())
  {
    return Cow::Owned(parsed);
  }
  Cow::Borrowed(record)
}

/// Converts a value to a finite number.
///
/// Accepts JSON numbers and strings holding a decimal number (surrounding
/// whitespace ignored). Everything else, including `NaN` and infinities, is
/// rejected.
pub fn parse_number(value: &Value) -> Option<f64> {
  let number = match value {
    Value::Number(n) => n.as_f64()?,
    Value::String(s) => s.trim().parse::<f64>().ok()?,
    _ => return None,
  };
  number.is_finite().then_some(number)
}
