//! # json-metrics - Prometheus metrics from JSON documents
//!
//! Turns arbitrary JSON documents, pushed through webhooks, into Prometheus
//! counters and gauges. What to extract is described entirely by jq
//! expressions in a YAML configuration.
//!
//! ## Key Features
//!
//! - **Declarative extraction**: path, filter, value and label expressions per metric
//! - **Counters and gauges**: gauges either set or accumulate
//! - **Webhooks**: method and header checks, payload transforms, fan-out to collectors
//! - **Backpressure**: a webhook waits until its collectors have taken each document
//!
//! ## Quick Start
//!
//! ```rust
//! use json_metrics::{Collector, Config};
//! use prometheus::Registry;
//! use serde_json::json;
//! use std::time::{Duration, Instant};
//!
//! let config = Config::from_yaml(r#"
//! collectors:
//!   example:
//!     namespace: example
//!     metrics:
//!       - name: value_count
//!         type: counter
//!         path: .values[]
//!         value: .count
//!         labels:
//!           - name: id
//!             value: .id
//! "#).unwrap();
//!
//! let registry = Registry::new();
//! let collector = Collector::new("example", &config.collectors["example"], &registry).unwrap();
//!
//! let document = json!({"values": [{"id": "A", "count": 2}, {"id": "A", "count": 3}]});
//! let deadline = Instant::now() + Duration::from_secs(1);
//! assert!(collector.process(&document, deadline));
//!
//! let families = registry.gather();
//! assert_eq!(families[0].get_name(), "example_value_count");
//! assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 5.0);
//! ```
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration and validation
//! - [`expr`]: Compiled jq expressions
//! - [`sanitize`]: JSON scalar to sample value conversion
//! - [`collector`]: Metric extraction from documents
//! - [`dispatch`]: Per-collector queue and job scheduling
//! - [`webhook`]: HTTP ingestion
//! - [`exporter`]: Wiring of all of the above
//! - [`instrumentation`]: The exporter's own metrics

// Modules
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exporter;
pub mod expr;
pub mod instrumentation;
pub mod sanitize;
pub mod webhook;

// Re-exports for convenient access
pub use collector::Collector;
pub use config::{
    BindingConfig, CollectorConfig, Config, GaugeOperation, HeaderConfig, LabelConfig,
    MetricConfig, MetricKind, MetricType, WebhookConfig,
};
pub use dispatch::{rendezvous, CollectorHandle, DispatchLoop, Inbox};
pub use error::{
    CollectError, ConfigError, DispatchError, EvalError, ExtractionError, Result, ValueError,
};
pub use exporter::{Exporter, DEFAULT_NAMESPACE};
pub use expr::Expr;
pub use instrumentation::{CollectionRecorder, Instrumentation};
pub use sanitize::sanitize_value;
pub use webhook::{WebhookHandler, WebhookResponse};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
