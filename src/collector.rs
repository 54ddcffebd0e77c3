//! Metric extraction from JSON documents
//!
//! A [`Collector`] owns the compiled metric definitions of one configured
//! collector. [`Collector::process`] runs a document through every metric:
//!
//! 1. the path expression selects candidate records;
//! 2. each candidate goes through filter, labels, value and sanitizing;
//! 3. the metric vector is updated once per accepted candidate.
//!
//! A failure stops the metric it happened in and marks the document as
//! failed; the remaining metrics still run. A path that runs into a missing
//! field just yields nothing.

use crate::config::{CollectorConfig, GaugeOperation, LabelConfig, MetricConfig, MetricKind};
use crate::error::{CollectError, EvalError, ExtractionError, Result, ValueError};
use crate::expr::{label_value, Expr};
use crate::instrumentation::registration;
use crate::sanitize::sanitize_value;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use serde_json::Value;
use std::fmt;
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{debug, error};

/// Compiled metric definitions of one collector.
pub struct Collector {
    id: String,
    metrics: Vec<JsonMetric>,
}

struct JsonMetric {
    name: String,
    path: Expr,
    filter: Expr,
    value: Expr,
    labels: Vec<JsonLabel>,
    series: Series,
}

#[derive(Clone)]
struct JsonLabel {
    name: String,
    value: Expr,
}

/// Registered vector, tagged with how it takes observations.
enum Series {
    Counter(CounterVec),
    Gauge(GaugeVec, GaugeOperation),
}

impl Collector {
    /// Compile every expression of `config` and register its metric vectors.
    pub fn new(id: impl Into<String>, config: &CollectorConfig, registry: &Registry) -> Result<Self> {
        let id = id.into();

        let default_labels = config
            .default_labels
            .iter()
            .map(JsonLabel::compile)
            .collect::<Result<Vec<_>>>()?;

        let metrics = config
            .metrics
            .iter()
            .map(|m| {
                JsonMetric::new(
                    m.clone().with_defaults(),
                    &config.namespace,
                    &default_labels,
                    registry,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(collector = %id, metrics = metrics.len(), "collector created");
        Ok(Self { id, metrics })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Names of the metrics in evaluation order.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    /// Collect every metric from `document`.
    ///
    /// Returns true when no metric failed for this document. Records
    /// skipped by a filter and paths absent from the document are not
    /// failures.
    pub fn process(&self, document: &Value, deadline: Instant) -> bool {
        let mut success = true;
        for metric in &self.metrics {
            if let Err(err) = metric.process(document, deadline) {
                error!(collector = %self.id, metric = %metric.name, %err, "unable to collect");
                success = false;
            }
        }
        success
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("id", &self.id)
            .field("metrics", &self.metric_names().collect::<Vec<_>>())
            .finish()
    }
}

impl JsonLabel {
    fn compile(config: &LabelConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            value: Expr::compile(&config.value)?,
        })
    }
}

impl JsonMetric {
    fn new(
        config: MetricConfig,
        namespace: &str,
        default_labels: &[JsonLabel],
        registry: &Registry,
    ) -> Result<Self> {
        let mut labels = default_labels.to_vec();
        for label in &config.labels {
            labels.push(JsonLabel::compile(label)?);
        }
        let label_names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();

        let opts = Opts::new(config.name.clone(), config.help.clone()).namespace(namespace);
        let series = match config.kind() {
            MetricKind::Counter => {
                let vec = CounterVec::new(opts, &label_names).map_err(registration(&config.name))?;
                registry
                    .register(Box::new(vec.clone()))
                    .map_err(registration(&config.name))?;
                Series::Counter(vec)
            }
            MetricKind::Gauge(operation) => {
                let vec = GaugeVec::new(opts, &label_names).map_err(registration(&config.name))?;
                registry
                    .register(Box::new(vec.clone()))
                    .map_err(registration(&config.name))?;
                Series::Gauge(vec, operation)
            }
        };

        Ok(Self {
            path: Expr::compile(&config.path)?,
            filter: Expr::compile(&config.filter)?,
            value: Expr::compile(&config.value)?,
            name: config.name,
            labels,
            series,
        })
    }

    /// Walk the path results, stopping at the first failure.
    fn process(&self, document: &Value, deadline: Instant) -> std::result::Result<(), CollectError> {
        let mut outcome = Ok(());
        self.path.for_each(document, deadline, |item| match item {
            Ok(record) => match self.collect(&record, deadline) {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    outcome = Err(err);
                    ControlFlow::Break(())
                }
            },
            // path not present in this document
            Err(EvalError::NullIteration) => ControlFlow::Break(()),
            Err(err) => {
                outcome = Err(CollectError::Path(err));
                ControlFlow::Break(())
            }
        });
        outcome
    }

    /// Filter, label, value, sanitize, update. Nothing is written unless
    /// every step succeeds.
    fn collect(&self, record: &Value, deadline: Instant) -> std::result::Result<(), CollectError> {
        let filter = self
            .filter
            .first(record, deadline)
            .map_err(ExtractionError::Filter)?;
        if filter == Some(Value::Bool(false)) {
            return Ok(());
        }

        let labels = self.extract_labels(record, deadline)?;

        let value = self
            .value
            .first(record, deadline)
            .map_err(ExtractionError::Value)?
            .unwrap_or(Value::Null);
        let value = sanitize_value(&value)?;

        self.update(&labels, value)
    }

    fn extract_labels(
        &self,
        record: &Value,
        deadline: Instant,
    ) -> std::result::Result<Vec<String>, ExtractionError> {
        self.labels
            .iter()
            .map(|label| {
                label
                    .value
                    .first(record, deadline)
                    .map(|v| label_value(v.as_ref()))
                    .map_err(|source| ExtractionError::Label {
                        label: label.name.clone(),
                        source,
                    })
            })
            .collect()
    }

    fn update(&self, labels: &[String], value: f64) -> std::result::Result<(), CollectError> {
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        match &self.series {
            Series::Counter(vec) => {
                // unmeasurable, nothing to add
                if value.is_nan() {
                    debug!(metric = %self.name, labels = ?labels, "skipping NaN counter observation");
                    return Ok(());
                }
                // prometheus counters cannot go down
                if value < 0.0 {
                    return Err(ValueError::CounterDecrease(value).into());
                }
                vec.get_metric_with_label_values(&labels)
                    .map_err(|e| CollectError::Update(e.to_string()))?
                    .inc_by(value);
            }
            Series::Gauge(vec, operation) => {
                let gauge = vec
                    .get_metric_with_label_values(&labels)
                    .map_err(|e| CollectError::Update(e.to_string()))?;
                match operation {
                    GaugeOperation::Add => gauge.add(value),
                    GaugeOperation::Set => gauge.set(value),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricType;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn label(name: &str, value: &str) -> LabelConfig {
        LabelConfig {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn metric(name: &str, metric_type: MetricType) -> MetricConfig {
        MetricConfig {
            name: name.to_string(),
            metric_type,
            ..Default::default()
        }
    }

    fn values_metric(name: &str, metric_type: MetricType) -> MetricConfig {
        MetricConfig {
            path: ".values[]".to_string(),
            filter: r#".state == "ACTIVE""#.to_string(),
            value: ".count".to_string(),
            labels: vec![label("id", ".id")],
            ..metric(name, metric_type)
        }
    }

    fn new_collector(registry: &Registry, metrics: Vec<MetricConfig>) -> Collector {
        let config = CollectorConfig {
            namespace: "test".to_string(),
            metrics,
            ..Default::default()
        };
        Collector::new("test", &config, registry).unwrap()
    }

    /// Series of a family as `label=value,...` -> value.
    fn series(registry: &Registry, name: &str) -> BTreeMap<String, f64> {
        registry
            .gather()
            .iter()
            .filter(|mf| mf.get_name() == name)
            .flat_map(|mf| mf.get_metric().iter())
            .map(|m| {
                let labels = m
                    .get_label()
                    .iter()
                    .map(|l| format!("{}={}", l.get_name(), l.get_value()))
                    .collect::<Vec<_>>()
                    .join(",");
                let value = if m.has_counter() {
                    m.get_counter().get_value()
                } else {
                    m.get_gauge().get_value()
                };
                (labels, value)
            })
            .collect()
    }

    fn repeated_data() -> Value {
        json!({
            "counter": 1234,
            "timestamp": 1657568506,
            "values": [
                {"id": "id-A", "count": 2, "some_boolean": true, "state": "ACTIVE"},
                {"id": "id-B", "count": 5, "some_boolean": true, "state": "INACTIVE"},
                {"id": "id-C", "count": 3, "some_boolean": false, "state": "ACTIVE"},
                {"id": "id-C", "count": 4, "some_boolean": false, "state": "ACTIVE"}
            ],
            "location": "mars"
        })
    }

    #[test]
    fn test_empty_data() {
        let registry = Registry::new();
        let mut m = metric("value_count", MetricType::Counter);
        m.path = ".values[]".to_string();
        let collector = new_collector(&registry, vec![m]);

        assert!(collector.process(&json!({}), deadline()));
        assert!(collector.process(&json!({"some": "random"}), deadline()));
        assert!(series(&registry, "test_value_count").is_empty());
    }

    #[test]
    fn test_error_path() {
        let registry = Registry::new();
        let mut m = metric("value_count", MetricType::Counter);
        m.path = ".values[]".to_string();
        let collector = new_collector(&registry, vec![m]);

        let doc = json!([{"noun": "lion", "population": 123, "predator": true}]);
        assert!(!collector.process(&doc, deadline()));
        assert!(series(&registry, "test_value_count").is_empty());
    }

    #[test]
    fn test_filter_not_in_data() {
        let registry = Registry::new();
        let mut m = values_metric("value_count", MetricType::Counter);
        m.filter = r#".notInData == "ACTIVE""#.to_string();
        let collector = new_collector(&registry, vec![m]);

        assert!(collector.process(&repeated_data(), deadline()));
        assert!(series(&registry, "test_value_count").is_empty());
    }

    #[test]
    fn test_repeated_data() {
        let registry = Registry::new();
        let mut gauge_add = values_metric("value_gauge_with_add", MetricType::Gauge);
        gauge_add.operation = GaugeOperation::Add;
        let collector = new_collector(
            &registry,
            vec![
                values_metric("value_count", MetricType::Counter),
                values_metric("value_gauge", MetricType::Gauge),
                gauge_add,
            ],
        );

        assert!(collector.process(&repeated_data(), deadline()));

        let want = |a: f64, c: f64| {
            BTreeMap::from([("id=id-A".to_string(), a), ("id=id-C".to_string(), c)])
        };
        assert_eq!(series(&registry, "test_value_count"), want(2.0, 7.0));
        assert_eq!(series(&registry, "test_value_gauge"), want(2.0, 4.0));
        assert_eq!(series(&registry, "test_value_gauge_with_add"), want(2.0, 7.0));
    }

    #[test]
    fn test_label_values() {
        let registry = Registry::new();
        let location = label("location", r#""planet-" + .location"#);
        let text_metric = |name: &str, value: &str| MetricConfig {
            path: ".values_text[]".to_string(),
            filter: r#".state == "ACTIVE""#.to_string(),
            value: value.to_string(),
            labels: vec![label("id", ".id")],
            ..metric(name, MetricType::Counter)
        };

        let mut with_count = text_metric("value_boolean_with_count_label", ".some_boolean");
        with_count.labels.push(label("count", ".count"));

        let collector = new_collector(
            &registry,
            vec![
                MetricConfig {
                    value: ".counter".to_string(),
                    labels: vec![location.clone()],
                    ..metric("global_counter", MetricType::Gauge)
                },
                MetricConfig {
                    value: ".values | length".to_string(),
                    labels: vec![location],
                    ..metric("global_values", MetricType::Gauge)
                },
                text_metric("value_active", ""),
                text_metric("value_count", ".count"),
                text_metric("value_boolean", ".some_boolean"),
                with_count,
            ],
        );

        let doc = json!({
            "counter": 1234,
            "values": [
                {"id": "id-A", "count": 2, "some_boolean": true, "state": "ACTIVE"},
                {"id": "id-B", "count": 5, "some_boolean": true, "state": "INACTIVE"},
                {"id": "id-C", "count": 3, "some_boolean": false, "state": "ACTIVE"}
            ],
            "values_text": [
                {"id": "id-A", "count": "2", "some_boolean": "true", "state": "ACTIVE"},
                {"id": "id-B", "count": "5", "some_boolean": "true", "state": "INACTIVE"},
                {"id": "id-C", "count": "3.4", "some_boolean": "false", "state": "ACTIVE"}
            ],
            "location": "mars"
        });
        assert!(collector.process(&doc, deadline()));

        assert_eq!(
            series(&registry, "test_global_counter"),
            BTreeMap::from([("location=planet-mars".to_string(), 1234.0)])
        );
        assert_eq!(
            series(&registry, "test_global_values"),
            BTreeMap::from([("location=planet-mars".to_string(), 3.0)])
        );
        assert_eq!(
            series(&registry, "test_value_active"),
            BTreeMap::from([("id=id-A".to_string(), 1.0), ("id=id-C".to_string(), 1.0)])
        );
        assert_eq!(
            series(&registry, "test_value_boolean"),
            BTreeMap::from([("id=id-A".to_string(), 1.0), ("id=id-C".to_string(), 0.0)])
        );
        assert_eq!(
            series(&registry, "test_value_boolean_with_count_label"),
            BTreeMap::from([
                ("count=2,id=id-A".to_string(), 1.0),
                ("count=3.4,id=id-C".to_string(), 0.0)
            ])
        );

        let counts = series(&registry, "test_value_count");
        assert_relative_eq!(counts["id=id-A"], 2.0);
        assert_relative_eq!(counts["id=id-C"], 3.4);
    }

    #[test]
    fn test_failure_does_not_stop_sibling_metrics() {
        let registry = Registry::new();
        let mut broken = values_metric("broken", MetricType::Gauge);
        broken.value = ".id".to_string();
        let collector = new_collector(
            &registry,
            vec![broken, values_metric("value_count", MetricType::Counter)],
        );

        assert!(!collector.process(&repeated_data(), deadline()));
        assert!(series(&registry, "test_broken").is_empty());
        assert_eq!(series(&registry, "test_value_count").len(), 2);
    }

    #[test]
    fn test_label_error_writes_nothing() {
        let registry = Registry::new();
        let mut m = values_metric("value_count", MetricType::Counter);
        m.labels = vec![label("id", ".id"), label("first", ".tags[0]")];
        let collector = new_collector(&registry, vec![m]);

        // .tags is a string, indexing it fails for the first record
        let doc = json!({"values": [{"id": "id-A", "count": 1, "state": "ACTIVE", "tags": "x"}]});
        assert!(!collector.process(&doc, deadline()));
        assert!(series(&registry, "test_value_count").is_empty());
    }

    #[test]
    fn test_negative_counter_rejected() {
        let registry = Registry::new();
        let mut m = metric("delta", MetricType::Counter);
        m.value = ".delta".to_string();
        let collector = new_collector(&registry, vec![m]);

        assert!(!collector.process(&json!({"delta": -3}), deadline()));
        assert!(series(&registry, "test_delta").is_empty());
    }

    #[test]
    fn test_counter_absent_value_is_not_failure() {
        let registry = Registry::new();
        let mut missing = metric("missing", MetricType::Counter);
        missing.value = ".missing".to_string();
        let mut nil = metric("nil", MetricType::Counter);
        nil.value = ".count".to_string();
        let collector = new_collector(&registry, vec![missing, nil]);

        assert!(collector.process(&json!({}), deadline()));
        assert!(collector.process(&json!({"count": "<nil>"}), deadline()));
        assert!(series(&registry, "test_missing").is_empty());

        assert!(collector.process(&json!({"count": 3}), deadline()));
        assert_eq!(
            series(&registry, "test_nil"),
            BTreeMap::from([(String::new(), 3.0)])
        );
    }

    #[test]
    fn test_default_labels_prepended() {
        let registry = Registry::new();
        let config = CollectorConfig {
            namespace: "example".to_string(),
            default_labels: vec![label("environment", r#""beta""#)],
            metrics: vec![values_metric("value_count", MetricType::Counter)],
        };
        let collector = Collector::new("example", &config, &registry).unwrap();
        assert_eq!(collector.metric_names().collect::<Vec<_>>(), ["value_count"]);

        assert!(collector.process(&repeated_data(), deadline()));
        assert_eq!(
            series(&registry, "example_value_count"),
            BTreeMap::from([
                ("environment=beta,id=id-A".to_string(), 2.0),
                ("environment=beta,id=id-C".to_string(), 7.0)
            ])
        );
    }

    #[test]
    fn test_duplicate_registration_is_config_error() {
        let registry = Registry::new();
        let config = CollectorConfig {
            namespace: "test".to_string(),
            metrics: vec![metric("value_count", MetricType::Counter)],
            ..Default::default()
        };
        Collector::new("a", &config, &registry).unwrap();
        let err = Collector::new("b", &config, &registry).unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::Registration { .. }));
    }

    #[test]
    fn test_expired_deadline_fails_document() {
        let registry = Registry::new();
        let collector = new_collector(&registry, vec![metric("value_count", MetricType::Counter)]);
        let past = Instant::now() - Duration::from_millis(1);
        assert!(!collector.process(&json!({}), past));
    }
}
