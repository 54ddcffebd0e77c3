// JSON Exporter - Metrics from arbitrary JSON documents
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Document dispatch for collectors
//!
//! Every collector has one [`DispatchLoop`] that owns its inbound queue.
//! Producers hold cloned [`CollectorHandle`]s. The queue is a rendezvous:
//! [`CollectorHandle::send`] only returns once the loop has taken the
//! document, so a stalled collector slows down whoever feeds it.
//!
//! Each accepted document becomes its own job with a fixed deadline. Jobs
//! run concurrently, in no particular order, without a cap. On shutdown the
//! loop stops accepting and waits for the jobs it already started.

use crate::collector::Collector;
use crate::error::DispatchError;
use crate::instrumentation::CollectionRecorder;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Upper bound for a single collection job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// A document together with the acknowledgement the sender waits for.
#[derive(Debug)]
struct Envelope {
    document: Value,
    accepted: oneshot::Sender<()>,
}

/// Sending side of a collector's inbound queue.
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    collector: Arc<str>,
    tx: mpsc::Sender<Envelope>,
}

impl CollectorHandle {
    /// Id of the collector this handle feeds.
    pub fn collector(&self) -> &str {
        &self.collector
    }

    /// Hand `document` to the collector, waiting until it is accepted.
    pub async fn send(&self, document: Value) -> Result<(), DispatchError> {
        let (accepted, ack) = oneshot::channel();
        self.tx
            .send(Envelope { document, accepted })
            .await
            .map_err(|_| DispatchError::Stopped(self.collector.to_string()))?;
        ack.await
            .map_err(|_| DispatchError::Stopped(self.collector.to_string()))
    }
}

/// Receiving side of a collector's inbound queue.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Envelope>,
}

impl Inbox {
    /// Take the next document and release its sender. `None` once every
    /// handle is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        let envelope = self.rx.recv().await?;
        // the sender may have given up waiting, the document is still ours
        let _ = envelope.accepted.send(());
        Some(envelope.document)
    }
}

/// Create a connected handle and inbox for `collector`.
pub fn rendezvous(collector: impl Into<Arc<str>>) -> (CollectorHandle, Inbox) {
    // one slot for the hand-off itself; the acknowledgement provides the
    // rendezvous
    let (tx, rx) = mpsc::channel(1);
    (
        CollectorHandle {
            collector: collector.into(),
            tx,
        },
        Inbox { rx },
    )
}

/// Accept loop of one collector.
pub struct DispatchLoop {
    collector: Arc<Collector>,
    inbox: Inbox,
    recorder: Arc<dyn CollectionRecorder>,
    job_timeout: Duration,
}

impl DispatchLoop {
    /// Create the loop and the handle that feeds it.
    pub fn new(
        collector: Arc<Collector>,
        recorder: Arc<dyn CollectionRecorder>,
    ) -> (CollectorHandle, Self) {
        let (handle, inbox) = rendezvous(collector.id());
        (
            handle,
            Self {
                collector,
                inbox,
                recorder,
                job_timeout: DEFAULT_JOB_TIMEOUT,
            },
        )
    }

    /// Override the per-job deadline.
    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Accept documents until `shutdown` is cancelled, then wait for the
    /// jobs still in flight.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut jobs = JoinSet::new();
        info!(collector = %self.collector.id(), "starting collector");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                document = self.inbox.recv() => match document {
                    Some(document) => self.spawn_job(&mut jobs, document),
                    None => {
                        debug!(collector = %self.collector.id(), "no producers left");
                        break;
                    }
                },

                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    log_join(self.collector.id(), joined);
                }
            }
        }

        info!(
            collector = %self.collector.id(),
            in_flight = jobs.len(),
            "collector draining"
        );
        while let Some(joined) = jobs.join_next().await {
            log_join(self.collector.id(), joined);
        }
        info!(collector = %self.collector.id(), "collector stopped");
    }

    fn spawn_job(&self, jobs: &mut JoinSet<()>, document: Value) {
        let collector = Arc::clone(&self.collector);
        let recorder = Arc::clone(&self.recorder);
        let job_timeout = self.job_timeout;

        jobs.spawn(async move {
            let start = Instant::now();
            let deadline = start + job_timeout;

            let worker = Arc::clone(&collector);
            let job = tokio::task::spawn_blocking(move || worker.process(&document, deadline));
            let success = match tokio::time::timeout(job_timeout, job).await {
                Ok(Ok(success)) => success,
                Ok(Err(err)) => {
                    error!(collector = %collector.id(), %err, "collection job aborted");
                    false
                }
                Err(_) => {
                    // the worker thread keeps running until the engine yields,
                    // anything it produces past the deadline is discarded
                    error!(
                        collector = %collector.id(),
                        timeout = ?job_timeout,
                        "collection job timed out, abandoning worker"
                    );
                    false
                }
            };

            recorder.record_outcome(collector.id(), success);
            recorder.record_duration(collector.id(), start.elapsed().as_secs_f64(), success);

            if success {
                debug!(collector = %collector.id(), "metrics collection completed successfully");
            } else {
                error!(collector = %collector.id(), "metrics collection completed with error");
            }
        });
    }
}

fn log_join(collector: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(collector = %collector, %err, "collection job failed");
    }
}
