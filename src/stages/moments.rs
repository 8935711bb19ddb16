//! # Moments Reducer
//!
//! Per group key, buffers the numeric samples of every configured property and
//! summarizes them as count, mean and population standard deviation when the
//! key's window closes:
//!
//! ```json
//! {"group": "g", "count": 4, "results": {"a": {"count": 3, "mean": 2.0, "std_dev": 0.816}}}
//! ```
//!
//! The outer `count` is the number of records seen for the key; each
//! property's `count` is the number of values that parsed as numbers. Values
//! that are absent or non-numeric are skipped for that property only. A
//! property without any valid sample is reported as an empty object.
//!
//! Samples are kept in memory and summarized in two passes (mean, then squared
//! deviations), so memory grows with the number of samples per key.

use crate::accessor::{FieldAccessor, PathAccessor, parse_number};
use crate::config::{Settings, lenient_bool, lenient_list};
use crate::error::ConfigError;
use crate::record::Record;
use crate::stages::group::{Accumulator, AccumulatorFactory, Group, GroupConfig, GroupKey};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::warn;

/// Settings of the `moments` stage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MomentsConfig {
  /// Grouping settings; a key path is required.
  #[serde(flatten)]
  pub group: GroupConfig,
  /// Property paths to measure.
  #[serde(deserialize_with = "lenient_list")]
  pub of: Vec<String>,
  /// Skip the standard deviation.
  #[serde(deserialize_with = "lenient_bool")]
  pub no_std_dev: bool,
}

impl MomentsConfig {
  /// Reads the settings, dropping repeated properties.
  pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
    let mut config: MomentsConfig = serde_json::from_value(Value::Object(settings.clone()))
      .map_err(|e| ConfigError::InvalidSettings(e.to_string()))?;
    let mut seen = std::collections::HashSet::new();
    config.of.retain(|property| seen.insert(property.clone()));
    Ok(config)
  }
}

/// Summary statistics of one property's samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
  /// Number of samples.
  pub count: usize,
  /// Arithmetic mean.
  pub mean: f64,
  /// Population standard deviation, when requested.
  pub std_dev: Option<f64>,
}

impl Summary {
  /// Summarizes `samples`; `None` when there are none.
  pub fn of(samples: &[f64], with_std_dev: bool) -> Option<Self> {
    if samples.is_empty() {
      return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if !mean.is_finite() {
      warn!(samples = samples.len(), "Mean overflowed, it will be written as null");
    }
    let std_dev = with_std_dev.then(|| {
      let variance = samples.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
      if mean.is_finite() && !variance.is_finite() {
        warn!(samples = samples.len(), "Variance overflowed, std_dev will be written as null");
      }
      variance.sqrt()
    });
    Some(Self {
      count: samples.len(),
      mean,
      std_dev,
    })
  }

  fn to_value(self) -> Value {
    let mut entry = Map::new();
    entry.insert("count".to_string(), json!(self.count));
    entry.insert("mean".to_string(), json!(self.mean));
    if let Some(std_dev) = self.std_dev {
      entry.insert("std_dev".to_string(), json!(std_dev));
    }
    Value::Object(entry)
  }
}

/// Measurement buffers of one group key.
pub struct MomentsAccumulator {
  config: Arc<MomentsConfig>,
  accessor: Arc<dyn FieldAccessor>,
  measurements: IndexMap<String, Vec<f64>>,
}

impl MomentsAccumulator {
  /// Samples buffered so far for `property`.
  pub fn samples(&self, property: &str) -> Option<&[f64]> {
    self.measurements.get(property).map(Vec::as_slice)
  }

  /// Per-property summaries. Properties without samples map to `{}`.
  pub fn results(&self) -> Map<String, Value> {
    self
      .measurements
      .iter()
      .map(|(property, samples)| {
        let entry = Summary::of(samples, !self.config.no_std_dev)
          .map(Summary::to_value)
          .unwrap_or_else(|| Value::Object(Map::new()));
        (property.clone(), entry)
      })
      .collect()
  }
}

impl Accumulator for MomentsAccumulator {
  fn start(&mut self, _record: &Value) {
    self.measurements = self
      .config
      .of
      .iter()
      .map(|property| (property.clone(), Vec::new()))
      .collect();
  }

  fn accumulate(&mut self, record: &Value) {
    for property in &self.config.of {
      let Some(raw) = self.accessor.extract(record, property) else {
        continue;
      };
      let Some(sample) = parse_number(&raw) else {
        continue;
      };
      if let Some(samples) = self.measurements.get_mut(property) {
        samples.push(sample);
      }
    }
  }

  fn summarize(&self, key: &GroupKey, size: usize) -> Record {
    json!({
      "group": key.value(),
      "count": size,
      "results": self.results(),
    })
  }
}

/// Creates [`MomentsAccumulator`]s sharing one config.
pub struct MomentsFactory {
  config: Arc<MomentsConfig>,
  accessor: Arc<dyn FieldAccessor>,
}

impl MomentsFactory {
  /// Creates a factory using the dotted-path accessor.
  pub fn new(config: MomentsConfig) -> Self {
    Self {
      config: Arc::new(config),
      accessor: Arc::new(PathAccessor),
    }
  }
}

impl AccumulatorFactory for MomentsFactory {
  type Accumulator = MomentsAccumulator;

  fn create(&self) -> MomentsAccumulator {
    MomentsAccumulator {
      config: Arc::clone(&self.config),
      accessor: Arc::clone(&self.accessor),
      measurements: IndexMap::new(),
    }
  }
}

/// The `moments` stage.
pub type Moments = Group<MomentsFactory>;

impl Group<MomentsFactory> {
  /// Builds the `moments` stage from its settings.
  ///
  /// Fails with [`ConfigError::MissingKey`] when no key path is configured.
  pub fn moments(settings: &Settings) -> Result<Self, ConfigError> {
    let config = MomentsConfig::from_settings(settings)?;
    let selector = config.group.required_selector("moments")?;
    let window = config.group.window;
    Ok(Group::new("moments", selector, MomentsFactory::new(config)).with_window(window))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stage::Stage;
  use crate::test_support::with_captured_logs;
  use proptest::prelude::*;

  fn settings(value: Value) -> Settings {
    value.as_object().cloned().unwrap_or_default()
  }

  fn run(settings_value: Value, records: &[Value]) -> Vec<Value> {
    let mut stage = Moments::moments(&settings(settings_value)).unwrap();
    let mut out = Vec::new();
    for record in records {
      stage
        .process(record.clone(), &mut |r| {
          out.push(r);
          Ok(())
        })
        .unwrap();
    }
    stage
      .finalize(&mut |r| {
        out.push(r);
        Ok(())
      })
      .unwrap();
    out
  }

  fn accumulator(of: Value, no_std_dev: bool) -> MomentsAccumulator {
    let config =
      MomentsConfig::from_settings(&settings(json!({"of": of, "no_std_dev": no_std_dev})))
        .unwrap();
    let mut acc = MomentsFactory::new(config).create();
    acc.start(&Value::Null);
    acc
  }

  #[test]
  fn test_bad_samples_are_skipped_but_records_counted() {
    let out = run(
      json!({"group_by": "k", "of": "a"}),
      &[
        json!({"k": "g", "a": "1"}),
        json!({"k": "g", "a": "2"}),
        json!({"k": "g", "a": "x"}),
        json!({"k": "g", "a": "3"}),
      ],
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["group"], json!("g"));
    assert_eq!(out[0]["count"], json!(4));
    let a = &out[0]["results"]["a"];
    assert_eq!(a["count"], json!(3));
    assert_eq!(a["mean"], json!(2.0));
    let std_dev = a["std_dev"].as_f64().unwrap();
    assert!((std_dev - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
  }

  #[test]
  fn test_no_std_dev_omits_the_field() {
    let out = run(
      json!({"group_by": "k", "of": ["a"], "no_std_dev": true}),
      &[json!({"k": 1, "a": 1}), json!({"k": 1, "a": 3})],
    );
    assert_eq!(out[0]["results"], json!({"a": {"count": 2, "mean": 2.0}}));
  }

  #[test]
  fn test_property_without_samples_has_empty_entry() {
    let out = run(
      json!({"group_by": "k", "of": "a,b"}),
      &[json!({"k": 1, "a": 5, "b": "n/a"}), json!({"k": 1, "a": "7"})],
    );
    let results = &out[0]["results"];
    assert_eq!(results["b"], json!({}));
    assert_eq!(results["a"]["count"], json!(2));
    assert!(results.get("c").is_none());
  }

  #[test]
  fn test_no_configured_properties_yields_empty_results() {
    let out = run(json!({"group_by": "k", "of": {"a": 1}}), &[json!({"k": 1, "a": 5})]);
    assert_eq!(out, vec![json!({"group": 1, "count": 1, "results": {}})]);
  }

  #[test]
  fn test_missing_key_path_is_a_config_error() {
    assert!(matches!(
      Moments::moments(&settings(json!({"of": "a"}))),
      Err(ConfigError::MissingKey { .. })
    ));
  }

  #[test]
  fn test_nested_property_paths() {
    let out = run(
      json!({"by": "user.id", "of": "stats.latency"}),
      &[
        json!({"user": {"id": 7}, "stats": {"latency": 10}}),
        json!({"user": {"id": 7}, "stats": {"latency": 20}}),
        json!({"user": {"id": 7}, "stats": null}),
      ],
    );
    assert_eq!(out[0]["group"], json!(7));
    assert_eq!(out[0]["count"], json!(3));
    assert_eq!(out[0]["results"]["stats.latency"]["mean"], json!(15.0));
  }

  #[test]
  fn test_start_resets_buffers() {
    let mut acc = accumulator(json!("a"), false);
    acc.accumulate(&json!({"a": 1}));
    assert_eq!(acc.samples("a"), Some(&[1.0][..]));
    acc.start(&Value::Null);
    assert_eq!(acc.samples("a"), Some(&[][..]));
  }

  #[test]
  fn test_repeated_properties_are_measured_once() {
    let mut acc = accumulator(json!("a,a"), false);
    acc.accumulate(&json!({"a": 1}));
    assert_eq!(acc.samples("a"), Some(&[1.0][..]));
  }

  #[test]
  fn test_results_are_not_consumed() {
    let mut acc = accumulator(json!("a"), false);
    acc.accumulate(&json!({"a": 4}));
    assert_eq!(acc.results(), acc.results());
  }

  fn summarize_with_logs(samples: &[f64]) -> (Summary, String) {
    let (summary, logs) = with_captured_logs(|| Summary::of(samples, true));
    (summary.unwrap(), logs)
  }

  #[test]
  fn test_overflowing_mean_is_reported() {
    let (summary, logs) = summarize_with_logs(&[f64::MAX, f64::MAX]);
    assert!(summary.mean.is_infinite());
    assert!(logs.contains("Mean overflowed"), "logs were: {}", logs);
    assert_eq!(summary.to_value()["mean"], Value::Null);
  }

  #[test]
  fn test_overflowing_variance_is_reported() {
    let (summary, logs) = summarize_with_logs(&[1e300, -1e300]);
    assert_eq!(summary.mean, 0.0);
    assert!(summary.std_dev.is_some_and(|s| s.is_infinite()));
    assert!(logs.contains("Variance overflowed"), "logs were: {}", logs);
  }

  #[test]
  fn test_ordinary_samples_log_nothing() {
    let (_, logs) = summarize_with_logs(&[1.0, 2.0, 3.0]);
    assert!(logs.is_empty(), "logs were: {}", logs);
  }

  proptest! {
    #[test]
    fn prop_count_matches_parsed_samples(values in prop::collection::vec(
      prop_oneof![
        (-1e6f64..1e6).prop_map(|x| json!(x)),
        (-1000i64..1000).prop_map(|x| json!(x.to_string())),
        Just(json!("oops")),
        Just(Value::Null),
      ],
      1..50,
    )) {
      let mut acc = accumulator(json!("a"), false);
      let valid = values.iter().filter(|v| parse_number(v).is_some()).count();
      for value in &values {
        acc.accumulate(&json!({ "a": value }));
      }
      let results = acc.results();
      if valid == 0 {
        prop_assert_eq!(&results["a"], &json!({}));
      } else {
        prop_assert_eq!(&results["a"]["count"], &json!(valid));
      }
    }

    #[test]
    fn prop_mean_and_population_std_dev(samples in prop::collection::vec(-1e3f64..1e3, 1..100)) {
      let summary = Summary::of(&samples, true).unwrap();
      let n = samples.len() as f64;
      let mean = samples.iter().sum::<f64>() / n;
      let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
      prop_assert!((summary.mean - mean).abs() < 1e-9);
      prop_assert!((summary.std_dev.unwrap() - variance.sqrt()).abs() < 1e-9);
      prop_assert_eq!(Summary::of(&samples, false).unwrap().std_dev, None);
    }
  }
}
