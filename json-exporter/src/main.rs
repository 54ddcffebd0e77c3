// JSON Exporter - Prometheus exporter for JSON webhooks
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # JSON Exporter
//!
//! Receives JSON documents on webhooks and exposes the metrics extracted
//! from them to Prometheus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! json-exporter --exporter-config json-exporter.yaml
//!
//! # Listen elsewhere, expose metrics on a custom path
//! json-exporter --listen-address 127.0.0.1:9100 --metrics-path /prom
//! ```

mod metrics;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use json_metrics::{ConfigError, Config, Exporter, DEFAULT_NAMESPACE};
use metrics::{encode_metrics, CONTENT_TYPE};
use prometheus::Registry;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// JSON Prometheus Exporter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Address to listen on for webhooks and metrics
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:9000")]
    listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Collector and webhook configuration file
    #[arg(long, env = "EXPORTER_CONFIG", default_value = "json-exporter.yaml")]
    exporter_config: PathBuf,

    /// Namespace of the exporter's own metrics
    #[arg(long, env = "EXPORTER_METRICS_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    exporter_metrics_namespace: String,
}

#[derive(Error, Debug)]
enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("route {path} is used by webhook {webhook} and the exporter")]
    RouteConflict { path: String, webhook: String },

    #[error("metrics path should have '/' prefix: {0}")]
    MetricsPath(String),

    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Application state shared across handlers.
struct AppState {
    registry: Registry,
    start_time: Instant,
    collectors: Vec<String>,
    webhooks: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("JSON Exporter v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "exporter stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), ExporterError> {
    let config = Config::load(&args.exporter_config)?;
    let registry = Registry::new();
    let mut exporter =
        Exporter::from_config(&config, &registry, &args.exporter_metrics_namespace)?;
    check_routes(&exporter, &args.metrics_path)?;

    let state = Arc::new(AppState {
        registry,
        start_time: Instant::now(),
        collectors: exporter.collector_ids().map(str::to_string).collect(),
        webhooks: exporter
            .webhooks()
            .iter()
            .map(|w| w.path().to_string())
            .collect(),
    });

    // Build router
    let app = Router::new()
        .route(&args.metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
        .merge(exporter.router());

    let shutdown = CancellationToken::new();
    let collectors = exporter.spawn(&shutdown);

    // Start server
    let addr = args.listen_address;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ExporterError::Bind { addr, source })?;
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}{}", addr, args.metrics_path);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(ExporterError::Serve);

    // stop collectors even when the server failed on its own
    shutdown.cancel();
    for collector in collectors {
        if let Err(err) = collector.await {
            warn!(%err, "collector task failed");
        }
    }
    info!("exporter stopped");
    served
}

/// Webhook paths must not shadow the exporter's own routes.
fn check_routes(exporter: &Exporter, metrics_path: &str) -> Result<(), ExporterError> {
    if !metrics_path.starts_with('/') {
        return Err(ExporterError::MetricsPath(metrics_path.to_string()));
    }
    let reserved = [metrics_path, "/health", "/status"];
    for webhook in exporter.webhooks() {
        if reserved.contains(&webhook.path()) {
            return Err(ExporterError::RouteConflict {
                path: webhook.path().to_string(),
                webhook: webhook.id().to_string(),
            });
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(%err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("shutting down");
    shutdown.cancel();
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_metrics(&state.registry) {
        Ok(metrics) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], metrics),
        Err(err) => {
            error!(%err, "unable to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    collectors: Vec<String>,
    webhooks: Vec<String>,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        collectors: state.collectors.clone(),
        webhooks: state.webhooks.clone(),
    })
}
