//! A worker bundles everything one in-flight height needs: its own stats
//! service handle, its own progress journal and its own batch buffer. Workers
//! are moved between the pool and height tasks, never shared.

use crate::rpc::stats::StatsService;
use crate::runtime::config::SchedulerConfig;
use crate::runtime::error::SchedulerError;
use crate::runtime::journal::ProgressJournal;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::backoff::BoundedBackoff;
use crate::store::record::{StatsRecord, StatsStore};
use std::path::Path;
use std::sync::Arc;

pub struct Worker {
    id: usize,
    service: Box<dyn StatsService>,
    store: Arc<dyn StatsStore>,
    journal: ProgressJournal,
    batch: Vec<StatsRecord>,
    batch_size: usize,
    store_backoff: BoundedBackoff,
    telemetry: Arc<Telemetry>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("journal", &self.journal.path())
            .field("pending", &self.batch.len())
            .finish()
    }
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        service: Box<dyn StatsService>,
        store: Arc<dyn StatsStore>,
        journal: ProgressJournal,
        config: &SchedulerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let batch_size = config.store_batch_size().max(1);
        Self {
            id,
            service,
            store,
            journal,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            store_backoff: BoundedBackoff::new(
                config.store_retry_backoff(),
                config.store_max_backoff(),
                config.store_max_attempts(),
            ),
            telemetry,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn journal_path(&self) -> &Path {
        self.journal.path()
    }

    /// Last height written to this worker's journal.
    pub fn last_recorded(&self) -> Option<u64> {
        self.journal.last_recorded()
    }

    /// Records buffered but not yet handed to the store.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Queries the current head height through this worker's service handle.
    pub async fn current_head(&self) -> Result<u64, SchedulerError> {
        self.service
            .current_head()
            .await
            .map_err(|err| SchedulerError::service(None, err))
    }

    /// Fetches stats for `height` and hands them to the store, directly or via
    /// the batch buffer. The journal only advances past heights the store has
    /// accepted; buffered heights are journaled as pending.
    pub async fn process_height(&mut self, height: u64) -> Result<(), SchedulerError> {
        let stats = self
            .service
            .block_stats(height)
            .await
            .map_err(|err| SchedulerError::service(Some(height), err))?;

        if stats.height != height {
            tracing::warn!(
                worker = self.id,
                height,
                reported = stats.height,
                "stats service reported a different height"
            );
        }

        let record = StatsRecord::new(stats);
        if self.batch_size == 1 {
            self.store_one(height, &record).await?;
            self.journal.record(height).await?;
        } else {
            self.batch.push(record);
            if self.batch.len() >= self.batch_size {
                self.flush().await?;
            } else {
                let pending = self.batch.iter().map(StatsRecord::height).collect();
                self.journal.record_pending(pending).await?;
            }
        }

        tracing::debug!(worker = self.id, height, "height processed");
        Ok(())
    }

    async fn store_one(&self, height: u64, record: &StatsRecord) -> Result<(), SchedulerError> {
        let worker = self.id;
        let telemetry = &self.telemetry;
        self.store_backoff
            .run(
                |_| self.store.insert_one(record),
                |attempt, delay, err| {
                    telemetry.record_store_retry();
                    tracing::warn!(
                        worker,
                        height,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "store insert failed; retrying"
                    );
                },
            )
            .await
            .map_err(|err| SchedulerError::store(height, err))?;

        self.telemetry.record_stored(1);
        Ok(())
    }

    /// Hands every buffered record to the store in one batch insert.
    pub async fn flush(&mut self) -> Result<(), SchedulerError> {
        let Some(last_height) = self.batch.iter().map(StatsRecord::height).max() else {
            return Ok(());
        };

        let worker = self.id;
        let telemetry = &self.telemetry;
        let batch = &self.batch;
        self.store_backoff
            .run(
                |_| self.store.insert_batch(batch),
                |attempt, delay, err| {
                    telemetry.record_store_retry();
                    tracing::warn!(
                        worker,
                        records = batch.len(),
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "store batch insert failed; retrying"
                    );
                },
            )
            .await
            .map_err(|err| SchedulerError::store(last_height, err))?;

        let flushed = self.batch.len();
        self.batch.clear();
        self.telemetry.record_stored(flushed as u64);
        self.journal.record(last_height).await?;
        tracing::debug!(worker = self.id, records = flushed, last_height, "flushed store batch");
        Ok(())
    }

    /// Flushes outstanding records before the worker is dropped.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.flush().await?;
        tracing::debug!(
            worker = self.id,
            last = ?self.journal.last_recorded(),
            "worker shut down"
        );
        Ok(())
    }
}
