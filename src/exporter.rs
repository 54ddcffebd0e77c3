// JSON Exporter - Metrics from arbitrary JSON documents
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Wiring of collectors, dispatch loops and webhooks
//!
//! [`Exporter::from_config`] builds everything up front so that a bad
//! configuration fails before anything runs. [`Exporter::spawn`] then
//! starts one dispatch loop per collector.

use crate::collector::Collector;
use crate::config::Config;
use crate::dispatch::{CollectorHandle, DispatchLoop};
use crate::error::Result;
use crate::instrumentation::{CollectionRecorder, Instrumentation};
use crate::webhook::WebhookHandler;
use axum::Router;
use prometheus::Registry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default namespace of the exporter's own metrics.
pub const DEFAULT_NAMESPACE: &str = "json_exporter";

/// All collectors and webhooks of one configuration.
pub struct Exporter {
    instrumentation: Arc<Instrumentation>,
    collectors: BTreeMap<String, Arc<Collector>>,
    handles: HashMap<String, CollectorHandle>,
    webhooks: Vec<Arc<WebhookHandler>>,
    pending: Vec<DispatchLoop>,
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("collectors", &self.collectors)
            .field("webhooks", &self.webhooks)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Exporter {
    /// Register instrumentation and every collector in `registry`, and bind
    /// each webhook to its collectors.
    pub fn from_config(config: &Config, registry: &Registry, namespace: &str) -> Result<Self> {
        config.validate()?;

        let instrumentation = Arc::new(Instrumentation::new(registry, namespace)?);
        let recorder: Arc<dyn CollectionRecorder> = instrumentation.clone();

        let mut collectors = BTreeMap::new();
        let mut handles = HashMap::new();
        let mut pending = Vec::with_capacity(config.collectors.len());
        for (id, definition) in &config.collectors {
            let collector = Arc::new(Collector::new(id.as_str(), definition, registry)?);
            let (handle, dispatch) = DispatchLoop::new(Arc::clone(&collector), Arc::clone(&recorder));
            collectors.insert(id.clone(), collector);
            handles.insert(id.clone(), handle);
            pending.push(dispatch);
        }

        let webhooks = config
            .webhooks
            .iter()
            .map(|(id, definition)| {
                WebhookHandler::new(
                    id.as_str(),
                    definition,
                    &handles,
                    Arc::clone(&instrumentation),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            collectors = collectors.len(),
            webhooks = webhooks.len(),
            "exporter configured"
        );
        Ok(Self {
            instrumentation,
            collectors,
            handles,
            webhooks,
            pending,
        })
    }

    /// Start every dispatch loop not started yet.
    pub fn spawn(&mut self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.pending
            .drain(..)
            .map(|dispatch| tokio::spawn(dispatch.run(shutdown.clone())))
            .collect()
    }

    /// Routes for every webhook.
    pub fn router(&self) -> Router {
        self.webhooks.iter().fold(Router::new(), |router, webhook| {
            router.route(webhook.path(), Arc::clone(webhook).method_router())
        })
    }

    pub fn collector(&self, id: &str) -> Option<&Collector> {
        self.collectors.get(id).map(Arc::as_ref)
    }

    /// Collector ids in sorted order.
    pub fn collector_ids(&self) -> impl Iterator<Item = &str> {
        self.collectors.keys().map(String::as_str)
    }

    /// Queue handle of a collector, for feeding documents directly.
    pub fn handle(&self, id: &str) -> Option<&CollectorHandle> {
        self.handles.get(id)
    }

    pub fn webhooks(&self) -> &[Arc<WebhookHandler>] {
        &self.webhooks
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }
}
