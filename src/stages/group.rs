//! # Group Accumulator
//!
//! [`Group`] partitions the record stream by a derived [`GroupKey`] and drives
//! one [`Accumulator`] per key through `start -> accumulate* -> summarize`.
//! What is accumulated is up to the pluggable [`AccumulatorFactory`]: the
//! plain `group` stage counts records ([`CountFactory`]), the `moments` stage
//! measures numeric properties.
//!
//! ## Windows
//!
//! A window is the span between a key's first record and its finalization.
//! When windows close is set by [`WindowPolicy`]:
//!
//! - [`WindowPolicy::Stream`]: only when the surrounding pipeline finalizes
//!   (explicit flush or end of input). Every key seen in the window is
//!   summarized, in first-seen order.
//! - [`WindowPolicy::KeyChange`]: also whenever a record arrives with a key
//!   other than the current one. This is the reducer behavior for input sorted
//!   by key; a key that comes back later starts a fresh window.

use crate::accessor::{FieldAccessor, PathAccessor, structured};
use crate::config::{Settings, lenient_string};
use crate::error::{ConfigError, StageError};
use crate::record::Record;
use crate::stage::{Emit, Stage};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key a record is grouped under.
///
/// Equality and hashing use a canonical rendering of the value in which
/// object members are sorted, so `{"a":1,"b":2}` and `{"b":2,"a":1}` are the
/// same key.
#[derive(Debug, Clone)]
pub struct GroupKey {
  value: Value,
  canonical: String,
}

impl GroupKey {
  /// Wraps a key value.
  pub fn new(value: Value) -> Self {
    let canonical = canonical(&value);
    Self { value, canonical }
  }

  /// The key as it appeared in the record.
  pub fn value(&self) -> &Value {
    &self.value
  }
}

impl PartialEq for GroupKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

fn canonical(value: &Value) -> String {
  match value {
    Value::Object(map) => {
      let mut members: Vec<_> = map.iter().collect();
      members.sort_by(|a, b| a.0.cmp(b.0));
      let body = members
        .into_iter()
        .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical(v)))
        .collect::<Vec<_>>()
        .join(",");
      format!("{{{}}}", body)
    }
    Value::Array(items) => {
      let body = items.iter().map(canonical).collect::<Vec<_>>().join(",");
      format!("[{}]", body)
    }
    other => other.to_string(),
  }
}

/// Where the group key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
  /// The value at a field path; records without it share the `null` key.
  Path(String),
  /// The whole record.
  Record,
}

/// When a group's windows close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowPolicy {
  /// At explicit flush or end of input only.
  #[default]
  Stream,
  /// Also whenever the key changes between consecutive records.
  KeyChange,
}

impl WindowPolicy {
  fn parse(raw: &str) -> Self {
    match raw.trim().to_ascii_lowercase().as_str() {
      "key_change" | "key-change" | "sorted" => WindowPolicy::KeyChange,
      _ => WindowPolicy::Stream,
    }
  }
}

fn lenient_window<'de, D>(deserializer: D) -> Result<WindowPolicy, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Value::deserialize(deserializer)? {
    Value::String(s) => WindowPolicy::parse(&s),
    _ => WindowPolicy::Stream,
  })
}

/// Settings shared by every grouping stage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
  /// Field path to group by.
  #[serde(deserialize_with = "lenient_string")]
  pub group_by: Option<String>,
  /// Legacy name for `group_by`, used when `group_by` is absent.
  #[serde(deserialize_with = "lenient_string")]
  pub by: Option<String>,
  /// Window policy, `"stream"` (default) or `"key_change"`.
  #[serde(deserialize_with = "lenient_window")]
  pub window: WindowPolicy,
}

impl GroupConfig {
  /// Reads the grouping settings out of a stage's settings.
  pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
    serde_json::from_value(Value::Object(settings.clone()))
      .map_err(|e| ConfigError::InvalidSettings(e.to_string()))
  }

  /// The configured key path, `group_by` first, then `by`.
  pub fn key_path(&self) -> Option<&str> {
    self.group_by.as_deref().or(self.by.as_deref())
  }

  /// Key selector, keying on the whole record when no path is configured.
  pub fn selector(&self) -> KeySelector {
    match self.key_path() {
      Some(path) => KeySelector::Path(path.to_string()),
      None => KeySelector::Record,
    }
  }

  /// Key selector for stages that cannot key on the whole record.
  pub fn required_selector(&self, stage: &str) -> Result<KeySelector, ConfigError> {
    self
      .key_path()
      .map(|path| KeySelector::Path(path.to_string()))
      .ok_or_else(|| ConfigError::MissingKey {
        stage: stage.to_string(),
      })
  }
}

/// Per-key state of a grouping stage.
pub trait Accumulator: Send {
  /// Called with the first record of the key's window.
  fn start(&mut self, _record: &Value) {}

  /// Called with every record of the key's window, the first one included.
  fn accumulate(&mut self, record: &Value);

  /// Builds the summary emitted when the window closes. `size` is the number
  /// of records accumulated for the key.
  fn summarize(&self, key: &GroupKey, size: usize) -> Record;
}

/// Creates fresh accumulators for newly seen keys.
pub trait AccumulatorFactory: Send {
  /// Accumulator type produced.
  type Accumulator: Accumulator;

  /// Creates an accumulator for a key seen for the first time in a window.
  fn create(&self) -> Self::Accumulator;
}

/// Accumulator that only counts records.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter;

impl Accumulator for Counter {
  fn accumulate(&mut self, _record: &Value) {}

  fn summarize(&self, key: &GroupKey, size: usize) -> Record {
    json!({ "group": key.value(), "count": size })
  }
}

/// Factory for [`Counter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CountFactory;

impl AccumulatorFactory for CountFactory {
  type Accumulator = Counter;

  fn create(&self) -> Counter {
    Counter
  }
}

struct KeyState<A> {
  accumulator: A,
  size: usize,
}

/// A stage that keeps one accumulator per group key.
pub struct Group<F: AccumulatorFactory> {
  name: String,
  selector: KeySelector,
  window: WindowPolicy,
  accessor: Arc<dyn FieldAccessor>,
  factory: F,
  groups: IndexMap<GroupKey, KeyState<F::Accumulator>>,
}

impl<F: AccumulatorFactory> Group<F> {
  /// Creates a group keyed by `selector`, with stream windows and the
  /// dotted-path accessor.
  pub fn new(name: impl Into<String>, selector: KeySelector, factory: F) -> Self {
    Self {
      name: name.into(),
      selector,
      window: WindowPolicy::default(),
      accessor: Arc::new(PathAccessor),
      factory,
      groups: IndexMap::new(),
    }
  }

  /// Sets the window policy.
  #[must_use]
  pub fn with_window(mut self, window: WindowPolicy) -> Self {
    self.window = window;
    self
  }

  /// Replaces the accessor used to derive keys.
  #[must_use]
  pub fn with_accessor(mut self, accessor: Arc<dyn FieldAccessor>) -> Self {
    self.accessor = accessor;
    self
  }

  /// Number of keys with an open window.
  pub fn open_keys(&self) -> usize {
    self.groups.len()
  }

  /// Derives the group key of a (structured) record.
  pub fn get_key(&self, record: &Value) -> GroupKey {
    match &self.selector {
      KeySelector::Path(path) => {
        GroupKey::new(self.accessor.extract(record, path).unwrap_or(Value::Null))
      }
      KeySelector::Record => GroupKey::new(record.clone()),
    }
  }

  fn close_windows(&mut self, emit: &mut Emit<'_>) -> Result<(), StageError> {
    for (key, state) in self.groups.drain(..) {
      debug!(stage = %self.name, key = %key.canonical, size = state.size, "Closing group window");
      emit(state.accumulator.summarize(&key, state.size))?;
    }
    Ok(())
  }
}

impl Group<CountFactory> {
  /// Builds the plain counting `group` stage from its settings.
  pub fn counting(settings: &Settings) -> Result<Self, ConfigError> {
    let config = GroupConfig::from_settings(settings)?;
    Ok(Group::new("group", config.selector(), CountFactory).with_window(config.window))
  }
}

impl<F: AccumulatorFactory> Stage for Group<F> {
  fn name(&self) -> &str {
    &self.name
  }

  fn process(&mut self, record: Record, emit: &mut Emit<'_>) -> Result<(), StageError> {
    let record = structured(&record);
    let key = self.get_key(&record);

    if self.window == WindowPolicy::KeyChange
      && !self.groups.is_empty()
      && !self.groups.contains_key(&key)
    {
      self.close_windows(emit)?;
    }

    let factory = &self.factory;
    let state = self.groups.entry(key).or_insert_with(|| {
      let mut accumulator = factory.create();
      accumulator.start(&record);
      KeyState {
        accumulator,
        size: 0,
      }
    });
    state.accumulator.accumulate(&record);
    state.size += 1;
    Ok(())
  }

  fn finalize(&mut self, emit: &mut Emit<'_>) -> Result<(), StageError> {
    self.close_windows(emit)
  }

  fn stop(&mut self) -> Result<(), StageError> {
    if !self.groups.is_empty() {
      warn!(
        stage = %self.name,
        keys = self.groups.len(),
        "Discarding groups that were never finalized"
      );
      self.groups.clear();
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn settings(value: Value) -> Settings {
    value.as_object().cloned().unwrap_or_default()
  }

  fn feed<F: AccumulatorFactory>(group: &mut Group<F>, records: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for record in records {
      group
        .process(record.clone(), &mut |r| {
          out.push(r);
          Ok(())
        })
        .unwrap();
    }
    out
  }

  fn finish<F: AccumulatorFactory>(group: &mut Group<F>) -> Vec<Value> {
    let mut out = Vec::new();
    group
      .finalize(&mut |r| {
        out.push(r);
        Ok(())
      })
      .unwrap();
    out
  }

  #[test]
  fn test_counts_per_key_in_first_seen_order() {
    let mut group = Group::counting(&settings(json!({"group_by": "k"}))).unwrap();
    let emitted = feed(
      &mut group,
      &[json!({"k": "b"}), json!({"k": "a"}), json!({"k": "b"}), json!({})],
    );
    assert!(emitted.is_empty());
    assert_eq!(group.open_keys(), 3);
    assert_eq!(
      finish(&mut group),
      vec![
        json!({"group": "b", "count": 2}),
        json!({"group": "a", "count": 1}),
        json!({"group": null, "count": 1}),
      ]
    );
    assert_eq!(group.open_keys(), 0);
  }

  #[test]
  fn test_legacy_by_setting_is_honored() {
    let config = GroupConfig::from_settings(&settings(json!({"by": "old"}))).unwrap();
    assert_eq!(config.selector(), KeySelector::Path("old".to_string()));
    let config =
      GroupConfig::from_settings(&settings(json!({"by": "old", "group_by": "new"}))).unwrap();
    assert_eq!(config.selector(), KeySelector::Path("new".to_string()));
  }

  #[test]
  fn test_required_selector_reports_missing_key() {
    let config = GroupConfig::from_settings(&settings(json!({"group_by": 42.5}))).unwrap();
    assert!(config.required_selector("moments").is_ok());
    let config = GroupConfig::from_settings(&settings(json!({"group_by": [1]}))).unwrap();
    assert!(matches!(
      config.required_selector("moments"),
      Err(ConfigError::MissingKey { .. })
    ));
  }

  #[test]
  fn test_whole_record_key_without_path() {
    let mut group = Group::counting(&Settings::new()).unwrap();
    feed(&mut group, &[json!("x"), json!("y"), json!("x")]);
    assert_eq!(
      finish(&mut group),
      vec![json!({"group": "x", "count": 2}), json!({"group": "y", "count": 1})]
    );
  }

  #[test]
  fn test_raw_json_lines_are_keyed_by_field() {
    let mut group = Group::counting(&settings(json!({"group_by": "k"}))).unwrap();
    feed(
      &mut group,
      &[json!(r#"{"k": 1}"#), json!(r#"{"k": 1}"#), json!("not json")],
    );
    assert_eq!(
      finish(&mut group),
      vec![json!({"group": 1, "count": 2}), json!({"group": null, "count": 1})]
    );
  }

  #[test]
  fn test_object_keys_ignore_member_order() {
    let a = GroupKey::new(json!({"x": 1, "y": [1, {"b": 2, "a": 1}]}));
    let b = GroupKey::new(json!({"y": [1, {"a": 1, "b": 2}], "x": 1}));
    assert_eq!(a, b);
    assert_ne!(GroupKey::new(json!(1)), GroupKey::new(json!("1")));
  }

  #[test]
  fn test_key_change_window_emits_on_boundary() {
    let mut group =
      Group::counting(&settings(json!({"group_by": "k", "window": "key_change"}))).unwrap();
    let emitted = feed(
      &mut group,
      &[json!({"k": "a"}), json!({"k": "a"}), json!({"k": "b"}), json!({"k": "a"})],
    );
    assert_eq!(
      emitted,
      vec![json!({"group": "a", "count": 2}), json!({"group": "b", "count": 1})]
    );
    assert_eq!(finish(&mut group), vec![json!({"group": "a", "count": 1})]);
  }

  #[test]
  fn test_unknown_window_falls_back_to_stream() {
    let config = GroupConfig::from_settings(&settings(json!({"window": "hourly"}))).unwrap();
    assert_eq!(config.window, WindowPolicy::Stream);
    let config = GroupConfig::from_settings(&settings(json!({"window": 3}))).unwrap();
    assert_eq!(config.window, WindowPolicy::Stream);
  }

  #[test]
  fn test_key_reappearing_after_finalize_starts_fresh() {
    let mut group = Group::counting(&settings(json!({"group_by": "k"}))).unwrap();
    feed(&mut group, &[json!({"k": "a"}), json!({"k": "a"})]);
    assert_eq!(finish(&mut group), vec![json!({"group": "a", "count": 2})]);
    feed(&mut group, &[json!({"k": "a"})]);
    assert_eq!(finish(&mut group), vec![json!({"group": "a", "count": 1})]);
  }

  #[test]
  fn test_stop_discards_open_windows() {
    let mut group = Group::counting(&settings(json!({"group_by": "k"}))).unwrap();
    feed(&mut group, &[json!({"k": "a"})]);
    group.stop().unwrap();
    assert_eq!(group.open_keys(), 0);
    assert!(finish(&mut group).is_empty());
  }
}
