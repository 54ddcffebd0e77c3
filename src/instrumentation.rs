// JSON Exporter - Metrics from arbitrary JSON documents
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Self-instrumentation of the exporter.
//!
//! Registered in the same registry as the collected metrics, under the
//! exporter's own namespace:
//!
//! - `<ns>_collection_count{collector,success}` - collections per outcome
//! - `<ns>_collection_duration_seconds{collector,success}` - time per document
//! - `<ns>_webhook_requests_total{webhook,status}` - webhook responses

use crate::error::{ConfigError, Result};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::fmt;

/// Records the outcome of collection jobs.
pub trait CollectionRecorder: Send + Sync {
    fn record_outcome(&self, collector: &str, success: bool);
    fn record_duration(&self, collector: &str, seconds: f64, success: bool);
}

/// Process-wide exporter metrics.
#[derive(Clone)]
pub struct Instrumentation {
    collection_count: CounterVec,
    collection_duration: HistogramVec,
    webhook_requests: CounterVec,
}

impl fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentation").finish_non_exhaustive()
    }
}

impl Instrumentation {
    /// Create and register the exporter metrics.
    pub fn new(registry: &Registry, namespace: &str) -> Result<Self> {
        let collection_count = CounterVec::new(
            Opts::new("collection_count", "Success metric for every collection")
                .namespace(namespace),
            &["collector", "success"],
        )
        .map_err(registration("collection_count"))?;

        let collection_duration = HistogramVec::new(
            HistogramOpts::new("collection_duration_seconds", "Duration of a collection")
                .namespace(namespace),
            &["collector", "success"],
        )
        .map_err(registration("collection_duration_seconds"))?;

        let webhook_requests = CounterVec::new(
            Opts::new(
                "webhook_requests_total",
                "The total number of requests received",
            )
            .namespace(namespace),
            &["webhook", "status"],
        )
        .map_err(registration("webhook_requests_total"))?;

        registry
            .register(Box::new(collection_count.clone()))
            .map_err(registration("collection_count"))?;
        registry
            .register(Box::new(collection_duration.clone()))
            .map_err(registration("collection_duration_seconds"))?;
        registry
            .register(Box::new(webhook_requests.clone()))
            .map_err(registration("webhook_requests_total"))?;

        Ok(Self {
            collection_count,
            collection_duration,
            webhook_requests,
        })
    }

    /// Count one webhook response.
    pub fn record_request(&self, webhook: &str, status: u16) {
        self.webhook_requests
            .with_label_values(&[webhook, &status.to_string()])
            .inc();
    }

    /// Number of responses counted so far for a webhook and status.
    pub fn requests(&self, webhook: &str, status: u16) -> f64 {
        self.webhook_requests
            .with_label_values(&[webhook, &status.to_string()])
            .get()
    }

    /// Number of collections counted so far for a collector and outcome.
    pub fn collections(&self, collector: &str, success: bool) -> f64 {
        self.collection_count
            .with_label_values(&[collector, bool_label(success)])
            .get()
    }
}

impl CollectionRecorder for Instrumentation {
    fn record_outcome(&self, collector: &str, success: bool) {
        self.collection_count
            .with_label_values(&[collector, bool_label(success)])
            .inc();
    }

    fn record_duration(&self, collector: &str, seconds: f64, success: bool) {
        self.collection_duration
            .with_label_values(&[collector, bool_label(success)])
            .observe(seconds);
    }
}

fn bool_label(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

pub(crate) fn registration(name: &str) -> impl Fn(prometheus::Error) -> ConfigError + '_ {
    move |source| ConfigError::Registration {
        name: name.to_string(),
        source,
    }
}
