// JSON Exporter - Metrics from arbitrary JSON documents
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Webhook ingestion
//!
//! A [`WebhookHandler`] serves one configured route. A request goes through:
//!
//! 1. method check (400 on mismatch);
//! 2. static header credentials (401 on any missing or different header);
//! 3. JSON body decoding (400 on failure);
//! 4. every collector binding in order: the transform projects the payload
//!    into zero or more documents, each forwarded to the collector;
//! 5. the configured response.
//!
//! Every response is counted per webhook and status. Rejections carry no
//! body. Collection itself happens later, detached from the request, so
//! collector failures never reach the client.

use crate::config::{HeaderConfig, WebhookConfig};
use crate::dispatch::CollectorHandle;
use crate::error::{ConfigError, Result};
use crate::expr::Expr;
use crate::instrumentation::Instrumentation;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound for evaluating one transform against a payload.
pub const TRANSFORM_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwarding of payloads to one collector.
#[derive(Debug, Clone)]
pub struct Binding {
    collector: CollectorHandle,
    transform: Expr,
}

/// Handler for one configured webhook route.
pub struct WebhookHandler {
    id: String,
    method: Method,
    path: String,
    auth_headers: Vec<HeaderConfig>,
    status: StatusCode,
    response_headers: Vec<HeaderConfig>,
    message: String,
    bindings: Vec<Binding>,
    transform_timeout: Duration,
    instrumentation: Arc<Instrumentation>,
}

impl fmt::Debug for WebhookHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookHandler")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("bindings", &self.bindings)
            .field("transform_timeout", &self.transform_timeout)
            .finish_non_exhaustive()
    }
}

/// What a request is answered with.
#[derive(Debug)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl WebhookResponse {
    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

impl WebhookHandler {
    /// Build the handler for webhook `id`, resolving each binding against
    /// the collector handles.
    pub fn new(
        id: impl Into<String>,
        config: &WebhookConfig,
        collectors: &HashMap<String, CollectorHandle>,
        instrumentation: Arc<Instrumentation>,
    ) -> Result<Self> {
        let id = id.into();
        let invalid = |reason: String| ConfigError::Webhook {
            webhook: id.clone(),
            reason,
        };

        let method = Method::from_bytes(config.method.as_bytes())
            .map_err(|_| invalid(format!("invalid method {:?}", config.method)))?;
        let status = StatusCode::from_u16(config.response.status_code())
            .map_err(|_| invalid(format!("invalid response code {}", config.response.code)))?;
        for header in &config.response.headers {
            HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| invalid(format!("invalid response header {:?}", header.name)))?;
        }

        let mut bindings = Vec::with_capacity(config.collectors.len());
        for binding in &config.collectors {
            let collector = collectors.get(&binding.id).cloned().ok_or_else(|| {
                ConfigError::UnknownCollector {
                    webhook: id.clone(),
                    collector: binding.id.clone(),
                }
            })?;
            bindings.push(Binding {
                collector,
                transform: Expr::compile(&binding.transform)?,
            });
        }

        debug!(webhook = %id, path = %config.path, bindings = bindings.len(), "webhook created");
        Ok(Self {
            method,
            path: config.path.clone(),
            auth_headers: config.auth.headers.clone(),
            status,
            response_headers: config.response.headers.clone(),
            message: config.response.message.clone(),
            bindings,
            transform_timeout: TRANSFORM_TIMEOUT,
            instrumentation,
            id,
        })
    }

    /// Override the bound on a single transform evaluation.
    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Route path this handler is mounted on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serve one request.
    pub async fn handle(&self, method: &Method, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        let response = self.respond(method, headers, body).await;
        self.instrumentation
            .record_request(&self.id, response.status.as_u16());
        response
    }

    /// axum route serving this handler for every method; the method check
    /// happens in [`WebhookHandler::handle`].
    pub fn method_router(self: Arc<Self>) -> MethodRouter {
        any(move |method: Method, headers: HeaderMap, body: Bytes| async move {
            self.handle(&method, &headers, &body).await
        })
    }

    async fn respond(&self, method: &Method, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        if *method != self.method {
            info!(
                webhook = %self.id,
                received = %method,
                expected = %self.method,
                "invalid request received"
            );
            return WebhookResponse::empty(StatusCode::BAD_REQUEST);
        }

        if !self.authorized(headers) {
            info!(webhook = %self.id, "unauthorised request received");
            return WebhookResponse::empty(StatusCode::UNAUTHORIZED);
        }

        let payload: Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(err) => {
                error!(webhook = %self.id, %err, "unable to parse json body");
                return WebhookResponse::empty(StatusCode::BAD_REQUEST);
            }
        };

        for binding in &self.bindings {
            self.forward(binding, &payload).await;
        }

        WebhookResponse {
            status: self.status,
            headers: self.response_headers(),
            body: self.message.clone(),
        }
    }

    /// Every configured header must be present with exactly the expected
    /// value. Names compare case-insensitively, values do not.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        self.auth_headers.iter().all(|expected| {
            headers
                .get(expected.name.as_str())
                .is_some_and(|got| got.as_bytes() == expected.resolve().as_bytes())
        })
    }

    /// Run the binding's transform and hand each document to its collector.
    /// Elements that fail to transform are logged and skipped.
    async fn forward(&self, binding: &Binding, payload: &Value) {
        let deadline = Instant::now() + self.transform_timeout;
        let transform = binding.transform.clone();
        let input = payload.clone();
        let job = tokio::task::spawn_blocking(move || transform.collect(&input, deadline));

        let documents = match tokio::time::timeout(self.transform_timeout, job).await {
            Ok(Ok(documents)) => documents,
            Ok(Err(err)) => {
                error!(
                    webhook = %self.id,
                    collector = %binding.collector.collector(),
                    %err,
                    "transform aborted"
                );
                return;
            }
            Err(_) => {
                error!(
                    webhook = %self.id,
                    collector = %binding.collector.collector(),
                    transform = %binding.transform,
                    timeout = ?self.transform_timeout,
                    "transform timed out, abandoning worker"
                );
                return;
            }
        };

        for document in documents {
            match document {
                Ok(document) => {
                    if let Err(err) = binding.collector.send(document).await {
                        warn!(
                            webhook = %self.id,
                            collector = %binding.collector.collector(),
                            %err,
                            "unable to forward document"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        webhook = %self.id,
                        collector = %binding.collector.collector(),
                        transform = %binding.transform,
                        %err,
                        "unable to transform"
                    );
                }
            }
        }
    }

    fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for header in &self.response_headers {
            let Ok(name) = HeaderName::from_bytes(header.name.as_bytes()) else {
                continue;
            };
            match HeaderValue::from_str(&header.resolve()) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(err) => {
                    warn!(webhook = %self.id, header = %header.name, %err, "skipping response header");
                }
            }
        }
        headers
    }
}
