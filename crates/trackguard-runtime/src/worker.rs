//! [`Worker`] – drains the telemetry topic into the [`Evaluator`].
//!
//! Each bus message becomes one task on a [`JoinSet`]; a [`Semaphore`]
//! bounds how many evaluate at once. While every permit is taken the worker
//! stops receiving and messages queue on the broadcast channel.
//!
//! Shutdown is signalled over a `watch` channel. The worker then evaluates
//! whatever is still queued for it and waits for in-flight tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};
use trackguard_middleware::{EventBus, Topic, TopicReceiver};
use trackguard_types::{BusMessage, BusPayload, TrackError};

use crate::evaluator::{EvaluationReport, Evaluator};

/// Totals reported when [`Worker::run`] returns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Telemetry messages taken off the bus.
    pub messages: u64,
    /// Payloads the adapter rejected.
    pub rejected: u64,
    /// Packets evaluated.
    pub packets: u64,
    /// Packets whose cycle stopped on an error.
    pub failed: u64,
    /// Rule firings across all packets.
    pub fired: u64,
    /// Messages lost to channel lag.
    pub lagged: u64,
    /// Tasks that panicked.
    pub panicked: u64,
}

/// Live count of messages received, readable while the worker runs.
#[derive(Debug, Clone, Default)]
pub struct WorkerProgress(Arc<AtomicU64>);

impl WorkerProgress {
    pub fn received(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

type TaskResult = Result<Vec<EvaluationReport>, TrackError>;

pub struct Worker {
    evaluator: Arc<Evaluator>,
    receiver: TopicReceiver,
    permits: Arc<Semaphore>,
    progress: WorkerProgress,
}

impl Worker {
    /// Subscribes to the telemetry topic immediately, so anything published
    /// after this returns is seen by [`run`](Self::run).
    pub fn new(bus: &EventBus, evaluator: Arc<Evaluator>, concurrency: usize) -> Self {
        Self {
            evaluator,
            receiver: bus.subscribe_to(Topic::Telemetry),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            progress: WorkerProgress::default(),
        }
    }

    pub fn progress(&self) -> WorkerProgress {
        self.progress.clone()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut stats = WorkerStats::default();

        info!(concurrency = self.permits.available_permits(), "worker started");
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.receiver.recv() => match received {
                    Ok(message) => self.spawn(message, &mut tasks, &mut stats).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "telemetry subscriber lagged");
                        stats.lagged += n;
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => absorb(&mut stats, joined),
            }
        }

        loop {
            match self.receiver.try_recv() {
                Ok(message) => self.spawn(message, &mut tasks, &mut stats).await,
                Err(TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "telemetry subscriber lagged");
                    stats.lagged += n;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        while let Some(joined) = tasks.join_next().await {
            absorb(&mut stats, joined);
        }

        info!(?stats, "worker stopped");
        stats
    }

    async fn spawn(&self, message: BusMessage, tasks: &mut JoinSet<TaskResult>, stats: &mut WorkerStats) {
        self.progress.0.fetch_add(1, Ordering::AcqRel);
        let BusPayload::Telemetry(payload) = message.payload else {
            debug!(id = %message.id, "non-telemetry message on telemetry topic");
            return;
        };
        stats.messages += 1;

        // The semaphore is never closed.
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        let evaluator = Arc::clone(&self.evaluator);
        let span = info_span!("telemetry", id = %message.id, source = %message.source);
        tasks.spawn(
            async move {
                let _permit = permit;
                evaluator.process(&payload).await
            }
            .instrument(span),
        );
    }
}

fn absorb(stats: &mut WorkerStats, joined: Result<TaskResult, JoinError>) {
    match joined {
        Ok(Ok(reports)) => {
            for report in reports {
                stats.packets += 1;
                if !report.is_ok() {
                    stats.failed += 1;
                }
                if !report.fired.is_empty() {
                    stats.fired += report.fired.len() as u64;
                    info!(imei = %report.imei, fired = ?report.fired, "rules fired");
                }
            }
        }
        Ok(Err(_)) => stats.rejected += 1,
        Err(e) => {
            error!(error = %e, "evaluation task failed");
            stats.panicked += 1;
        }
    }
}
