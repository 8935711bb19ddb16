//! Stage settings and lenient setting deserializers.
//!
//! Settings reach stages as a JSON object, merged from command-line `--set`
//! pairs and pipeline file entries. Stages deserialize them once, at
//! construction, into typed config structs. The helpers here make that
//! deserialization forgiving: a value of an unexpected shape degrades to the
//! field's empty/default value instead of failing.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Raw settings for one stage.
pub type Settings = Map<String, Value>;

/// Overlays `overrides` on top of `base`; keys in `overrides` win.
pub fn merge(base: &Settings, overrides: &Settings) -> Settings {
  let mut merged = base.clone();
  for (key, value) in overrides {
    merged.insert(key.clone(), value.clone());
  }
  merged
}

/// Parses a `key=value` pair. The value is read as JSON when it parses,
/// otherwise kept as a string, so `--set no_std_dev=true` yields a boolean and
/// `--set of=a,b` a string.
pub fn parse_pair(pair: &str) -> Option<(String, Value)> {
  let (key, raw) = pair.split_once('=')?;
  let key = key.trim();
  if key.is_empty() {
    return None;
  }
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Some((key.to_string(), value))
}

/// Non-empty strings and numbers become `Some`, anything else `None`.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Value::deserialize(deserializer)? {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  })
}

/// Arrays keep their string (and number) entries, strings are split on
/// commas; entries are trimmed and empty ones dropped. Any other shape is
/// an empty list.
pub fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let entries = match Value::deserialize(deserializer)? {
    Value::String(s) => s.split(',').map(str::to_string).collect(),
    Value::Array(items) => items
      .into_iter()
      .filter_map(|item| match item {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
      })
      .collect(),
    _ => Vec::new(),
  };
  Ok(
    entries
      .into_iter()
      .map(|e| e.trim().to_string())
      .filter(|e| !e.is_empty())
      .collect(),
  )
}

/// Booleans, `"true"/"false"/"yes"/"no"/"1"/"0"` strings and the numbers 0/1.
/// Anything else is `false`.
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Value::deserialize(deserializer)? {
    Value::Bool(b) => b,
    Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
    Value::Number(n) => n.as_f64() == Some(1.0),
    _ => false,
  })
}
