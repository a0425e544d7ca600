//! Fixed-capacity worker pool.
//!
//! Idle workers sit in a bounded hand-off channel sized to the pool capacity.
//! Acquiring a worker moves it out of the channel and releasing moves it back,
//! so a worker is either idle or bound to exactly one task and never both.

use crate::rpc::stats::StatsServiceFactory;
use crate::runtime::config::SchedulerConfig;
use crate::runtime::error::SchedulerError;
use crate::runtime::journal::ProgressJournal;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::worker::Worker;
use crate::store::record::StatsStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    idle_rx: mpsc::Receiver<Worker>,
    releaser: WorkerReleaser,
    journal_paths: Vec<PathBuf>,
}

/// Cloneable handle that returns workers to their pool from task context.
///
/// The busy-worker count lives in [`Telemetry`]; the pool reads it from there.
#[derive(Debug, Clone)]
pub struct WorkerReleaser {
    idle_tx: mpsc::Sender<Worker>,
    telemetry: Arc<Telemetry>,
}

impl WorkerReleaser {
    pub fn release(&self, worker: Worker) {
        let worker_id = worker.id();
        match self.idle_tx.try_send(worker) {
            Ok(()) => self.telemetry.record_worker_released(),
            Err(TrySendError::Full(worker)) | Err(TrySendError::Closed(worker)) => {
                tracing::warn!(
                    worker = worker.id(),
                    "worker pool no longer accepts releases; dropping worker"
                );
            }
        }
        tracing::trace!(worker = worker_id, "worker released");
    }
}

impl WorkerPool {
    /// Creates `config.worker_count()` workers, each with its own service
    /// handle and a fresh journal named after `run_tag`. Any failure aborts the
    /// whole setup. `telemetry` holds the busy-worker count, so it must not be
    /// shared with another pool.
    pub fn setup(
        config: &SchedulerConfig,
        factory: &dyn StatsServiceFactory,
        store: Arc<dyn StatsStore>,
        run_tag: &str,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self, SchedulerError> {
        let capacity = config.worker_count();
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        let mut journal_paths = Vec::with_capacity(capacity);

        for worker_id in 0..capacity {
            let service = factory.connect(worker_id).map_err(|err| {
                SchedulerError::setup(format!("stats service for worker {worker_id}"), err)
            })?;
            let journal = ProgressJournal::create(config.journal_dir(), run_tag, worker_id)?;
            journal_paths.push(journal.path().to_path_buf());

            let worker = Worker::new(
                worker_id,
                service,
                store.clone(),
                journal,
                config,
                telemetry.clone(),
            );
            idle_tx.try_send(worker).map_err(|_| {
                SchedulerError::setup(
                    format!("worker {worker_id}"),
                    anyhow::anyhow!("idle queue rejected a fresh worker"),
                )
            })?;
        }

        tracing::info!(
            workers = capacity,
            run_tag,
            journal_dir = %config.journal_dir().display(),
            "worker pool ready"
        );

        Ok(Self {
            capacity,
            idle_rx,
            releaser: WorkerReleaser { idle_tx, telemetry },
            journal_paths,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn busy_count(&self) -> usize {
        self.releaser.telemetry.busy_workers()
    }

    pub fn idle_count(&self) -> usize {
        self.capacity.saturating_sub(self.busy_count())
    }

    /// Journal files owned by this pool's workers.
    pub fn journal_paths(&self) -> &[PathBuf] {
        &self.journal_paths
    }

    pub fn releaser(&self) -> WorkerReleaser {
        self.releaser.clone()
    }

    /// Takes one idle worker without waiting.
    pub fn try_acquire(&mut self) -> Option<Worker> {
        let worker = self.idle_rx.try_recv().ok()?;
        self.releaser.telemetry.record_worker_bound();
        tracing::trace!(worker = worker.id(), "worker acquired");
        Some(worker)
    }

    /// Retries [`Self::try_acquire`] every `interval` until a worker frees up.
    /// Returns `None` once `shutdown` is cancelled.
    pub async fn acquire_polling(
        &mut self,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Option<Worker> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(worker) = self.try_acquire() {
                return Some(worker);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep(interval) => {}
            }
        }
    }

    pub fn release(&self, worker: Worker) {
        self.releaser.release(worker);
    }

    /// Drains every worker, flushing its batch and closing its journal. Must
    /// only be called once no worker is bound to a task.
    pub async fn shutdown_all(&mut self) -> Result<(), SchedulerError> {
        let busy = self.busy_count();
        if busy > 0 {
            tracing::warn!(busy, "shutting down pool with workers still bound");
        }

        let mut first_error = None;
        let mut closed = 0;
        while let Ok(worker) = self.idle_rx.try_recv() {
            let worker_id = worker.id();
            if let Err(err) = worker.shutdown().await {
                tracing::error!(worker = worker_id, error = %err, "worker shutdown failed");
                first_error.get_or_insert(err);
            }
            closed += 1;
        }
        self.idle_rx.close();

        tracing::info!(workers = closed, "worker pool shut down");
        first_error.map_or(Ok(()), Err)
    }
}
