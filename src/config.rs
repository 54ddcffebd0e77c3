// JSON Exporter - Metrics from arbitrary JSON documents
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for collectors and webhooks
//!
//! A single YAML file describes both. It is loaded once at startup,
//! validated, and never reloaded.
//!
//! ```yaml
//! collectors:
//!   example:
//!     namespace: example
//!     defaultLabels:
//!       - name: environment
//!         value: '"beta"'
//!     metrics:
//!       - name: value_count
//!         type: counter
//!         path: .values[]
//!         filter: .state == "ACTIVE"
//!         value: .count
//!         labels:
//!           - name: id
//!             value: .id
//! webhooks:
//!   example:
//!     method: POST
//!     path: /webhook/example
//!     auth:
//!       headers:
//!         - name: Authorization
//!           valueFromEnv: SHARED_WEB_HOOK_KEY
//!     response:
//!       code: 200
//!       message: ok
//!     collectors:
//!       - id: example
//! ```

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Status code answered when a webhook does not configure one
pub const DEFAULT_RESPONSE_CODE: u16 = 200;

/// Top level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Collectors keyed by id
    #[serde(default)]
    pub collectors: BTreeMap<String, CollectorConfig>,

    /// Webhooks keyed by id
    #[serde(default)]
    pub webhooks: BTreeMap<String, WebhookConfig>,
}

/// A named group of metrics sharing a namespace and default labels
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    /// Prefix for every metric name of this collector
    #[serde(default)]
    pub namespace: String,

    /// Labels prepended to every metric's own labels
    #[serde(default, rename = "defaultLabels")]
    pub default_labels: Vec<LabelConfig>,

    /// Metrics, in evaluation order
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

/// Counter or gauge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Counter,
    Gauge,
}

/// How a gauge takes a new observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeOperation {
    /// Overwrite the current value
    #[default]
    Set,
    /// Add to the current value
    Add,
}

/// Metric kind resolved from `type` and `operation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge(GaugeOperation),
}

/// One metric extracted from documents
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricConfig {
    pub name: String,

    #[serde(default)]
    pub help: String,

    /// Selects candidate records; empty is the whole document
    #[serde(default)]
    pub path: String,

    /// Predicate per candidate; empty lets everything through
    #[serde(default)]
    pub filter: String,

    /// Value per candidate; empty counts occurrences
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub labels: Vec<LabelConfig>,

    #[serde(default, rename = "type")]
    pub metric_type: MetricType,

    /// Only meaningful for gauges
    #[serde(default)]
    pub operation: GaugeOperation,
}

impl MetricConfig {
    /// Fill in help text and the default value expression.
    pub fn with_defaults(mut self) -> Self {
        if self.help.is_empty() {
            self.help = format!("json_exporter metric:{}", self.name);
        }
        if self.value.is_empty() {
            self.value = "1".to_string();
        }
        self
    }

    pub fn kind(&self) -> MetricKind {
        match self.metric_type {
            MetricType::Counter => MetricKind::Counter,
            MetricType::Gauge => MetricKind::Gauge(self.operation),
        }
    }
}

/// Label name and the expression producing its value
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LabelConfig {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// An HTTP route feeding documents into collectors
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub response: ResponseConfig,

    /// Target collectors with their transforms, in forwarding order
    #[serde(default)]
    pub collectors: Vec<BindingConfig>,
}

/// Static header credentials
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
}

/// Response written after a request has been accepted
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseConfig {
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,

    #[serde(default)]
    pub message: String,

    /// Zero means [`DEFAULT_RESPONSE_CODE`]
    #[serde(default)]
    pub code: u16,
}

impl ResponseConfig {
    pub fn status_code(&self) -> u16 {
        if self.code == 0 {
            DEFAULT_RESPONSE_CODE
        } else {
            self.code
        }
    }
}

/// Header with a literal value or one read from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeaderConfig {
    pub name: String,

    #[serde(default)]
    pub value: String,

    #[serde(default, rename = "valueFromEnv")]
    pub value_from_env: String,
}

impl HeaderConfig {
    /// Literal value if set, otherwise the environment variable's value
    /// (empty when unset).
    pub fn resolve(&self) -> String {
        if !self.value.is_empty() {
            return self.value.clone();
        }
        std::env::var(&self.value_from_env).unwrap_or_default()
    }
}

/// Forwarding of a webhook payload to one collector
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingConfig {
    /// Collector id
    pub id: String,

    /// Projects the payload into zero or more documents; empty is identity
    #[serde(default)]
    pub transform: String,
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references and uniqueness rules.
    pub fn validate(&self) -> Result<()> {
        // metric names must be unique per namespace
        let mut names = HashSet::new();
        for (id, collector) in &self.collectors {
            for metric in &collector.metrics {
                let fq_name = format!("{}_{}", collector.namespace, metric.name);
                if !names.insert(fq_name) {
                    return Err(ConfigError::DuplicateMetric {
                        collector: id.clone(),
                        namespace: collector.namespace.clone(),
                        metric: metric.name.clone(),
                    });
                }
            }
        }

        // webhook paths must be unique
        let mut paths = HashSet::new();
        for (id, webhook) in &self.webhooks {
            let invalid = |reason: &str| ConfigError::Webhook {
                webhook: id.clone(),
                reason: reason.to_string(),
            };

            if webhook.path.is_empty() {
                return Err(invalid("empty path not allowed"));
            }
            if !webhook.path.starts_with('/') {
                return Err(invalid("path should have '/' prefix"));
            }
            if !paths.insert(webhook.path.as_str()) {
                return Err(invalid(&format!(
                    "webhooks path must be unique, duplicate path:{}",
                    webhook.path
                )));
            }

            for binding in &webhook.collectors {
                if !self.collectors.contains_key(&binding.id) {
                    return Err(ConfigError::UnknownCollector {
                        webhook: id.clone(),
                        collector: binding.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
collectors:
  example:
    namespace: example
    defaultLabels:
      - name: environment
        value: '"beta"'
    metrics:
      - name: value_count
        path: .values[]
        filter: .state == "ACTIVE"
        value: .count
        labels:
          - name: id
            value: .id
      - name: active_count
        type: gauge
        operation: add
        path: .values[]
  animals:
    namespace: animal
    metrics:
      - name: population
        type: gauge
        path: .[]
        value: .population
webhooks:
  example:
    method: POST
    path: /webhook/example
    auth:
      headers:
        - name: Authorization
          valueFromEnv: TEST_CONFIG_SHARED_KEY
    response:
      message: ok
    collectors:
      - id: example
        transform: .payload
"#;

    fn metric(name: &str) -> MetricConfig {
        MetricConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn collector(namespace: &str, metrics: &[&str]) -> CollectorConfig {
        CollectorConfig {
            namespace: namespace.to_string(),
            metrics: metrics.iter().map(|m| metric(m)).collect(),
            ..Default::default()
        }
    }

    fn webhook(path: &str) -> WebhookConfig {
        WebhookConfig {
            method: "POST".to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_example() {
        let config = Config::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.collectors.len(), 2);

        let example = &config.collectors["example"];
        assert_eq!(example.namespace, "example");
        assert_eq!(example.default_labels[0].name, "environment");
        assert_eq!(example.metrics[0].kind(), MetricKind::Counter);
        assert_eq!(
            example.metrics[1].kind(),
            MetricKind::Gauge(GaugeOperation::Add)
        );
        assert_eq!(
            config.collectors["animals"].metrics[0].kind(),
            MetricKind::Gauge(GaugeOperation::Set)
        );

        let wh = &config.webhooks["example"];
        assert_eq!(wh.method, "POST");
        assert_eq!(wh.auth.headers[0].value_from_env, "TEST_CONFIG_SHARED_KEY");
        assert_eq!(wh.response.status_code(), 200);
        assert_eq!(wh.collectors[0].transform, ".payload");
    }

    #[test]
    fn test_unknown_metric_type() {
        let yaml = r#"
collectors:
  c:
    metrics:
      - name: m
        type: histogram
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_set_defaults() {
        let got = metric("value_count").with_defaults();
        assert_eq!(
            got,
            MetricConfig {
                name: "value_count".to_string(),
                help: "json_exporter metric:value_count".to_string(),
                value: "1".to_string(),
                metric_type: MetricType::Counter,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_validate_metric_names() {
        let mut config = Config::default();
        config
            .collectors
            .insert("test1".into(), collector("ns1", &["metric_1", "metric_2"]));
        config
            .collectors
            .insert("test2".into(), collector("ns2", &["metric_1", "metric_2"]));
        assert!(config.validate().is_ok());

        config
            .collectors
            .insert("test2".into(), collector("ns1", &["metric_2"]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateMetric { .. })
        ));

        let mut config = Config::default();
        config
            .collectors
            .insert("test1".into(), collector("ns", &["metric_1", "metric_1"]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_webhook_paths() {
        let cases: &[(&str, &[&str], bool)] = &[
            ("empty_path", &[""], false),
            ("without_slash", &["path"], false),
            ("valid", &["/wh1", "/wh2", "/path/wh3"], true),
            ("duplicate_paths", &["/wh", "/wh", "/path/wh3"], false),
        ];

        for (name, paths, valid) in cases {
            let mut config = Config::default();
            for (i, path) in paths.iter().enumerate() {
                config.webhooks.insert(format!("test{i}"), webhook(path));
            }
            assert_eq!(config.validate().is_ok(), *valid, "{name}");
        }
    }

    #[test]
    fn test_validate_unknown_collector() {
        let mut config = Config::default();
        let mut wh = webhook("/wh");
        wh.collectors.push(BindingConfig {
            id: "missing".to_string(),
            transform: String::new(),
        });
        config.webhooks.insert("wh".into(), wh);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCollector { .. })
        ));
    }

    #[test]
    fn test_header_resolve() {
        std::env::set_var("TEST_CONFIG_HEADER_RESOLVE", "from-env");

        let literal = HeaderConfig {
            name: "Auth".to_string(),
            value: "literal".to_string(),
            value_from_env: "TEST_CONFIG_HEADER_RESOLVE".to_string(),
        };
        assert_eq!(literal.resolve(), "literal");

        let from_env = HeaderConfig {
            value: String::new(),
            ..literal
        };
        assert_eq!(from_env.resolve(), "from-env");

        let unset = HeaderConfig {
            name: "Auth".to_string(),
            value_from_env: "TEST_CONFIG_HEADER_UNSET_VARIABLE".to_string(),
            ..Default::default()
        };
        assert_eq!(unset.resolve(), "");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/json-exporter.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
