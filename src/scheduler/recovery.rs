//! Crash recovery: replays the heights recorded in journals left behind by a
//! previous run, then reports where ordinary dispatch should resume.
//!
//! A replayed height may already have reached the store before the crash, so
//! recovery delivers it again. The store sees at most one duplicate per
//! replayed height. Journals written in batch mode list every buffered height
//! that had not been stored, and each of them is replayed.

use crate::runtime::config::SchedulerConfig;
use crate::runtime::error::SchedulerError;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::journal::{JournalRecord, ProgressJournal, JOURNAL_FILE_PREFIX};
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::dispatcher::join_all;
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::task::{spawn_height_task, LeftoverClaim, TaskContext};
use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Journal left behind by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftoverJournal {
    pub path: PathBuf,
    pub record: JournalRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Heights replayed, one entry per replay task.
    pub replayed: Vec<u64>,
    /// One past the highest recorded height, or `None` when nothing was left over.
    pub resume_at: Option<u64>,
    pub removed_empty: usize,
}

pub struct RecoveryCoordinator<'p> {
    pool: &'p mut WorkerPool,
    journal_dir: PathBuf,
    poll_interval: Duration,
    fatal: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
}

impl<'p> RecoveryCoordinator<'p> {
    pub fn new(
        pool: &'p mut WorkerPool,
        config: &SchedulerConfig,
        fatal: FatalErrorHandler,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            pool,
            journal_dir: config.journal_dir().to_path_buf(),
            poll_interval: config.recovery_poll_interval(),
            fatal,
            telemetry,
        }
    }

    /// Collects non-empty journals in `dir`, skipping `exclude`. Empty journals
    /// are deleted on the way; unreadable or malformed ones are errors.
    pub fn scan(
        dir: &Path,
        exclude: &[PathBuf],
    ) -> Result<(Vec<LeftoverJournal>, usize), SchedulerError> {
        let entries = std::fs::read_dir(dir).map_err(|err| SchedulerError::journal(dir, err))?;

        let mut leftovers = Vec::new();
        let mut removed_empty = 0;
        for entry in entries {
            let entry = entry.map_err(|err| SchedulerError::journal(dir, err))?;
            let path = entry.path();
            let is_journal = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(JOURNAL_FILE_PREFIX));
            if !is_journal || !path.is_file() || exclude.contains(&path) {
                continue;
            }

            match ProgressJournal::read_record(&path)? {
                Some(record) => leftovers.push(LeftoverJournal { path, record }),
                None => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove empty journal");
                    } else {
                        removed_empty += 1;
                    }
                }
            }
        }

        leftovers.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((leftovers, removed_empty))
    }

    /// Replays every leftover journal through the pool and waits for all of
    /// the replayed heights to finish.
    pub async fn run(&mut self) -> Result<RecoveryOutcome, SchedulerError> {
        let (leftovers, removed_empty) =
            Self::scan(&self.journal_dir, self.pool.journal_paths())?;

        tracing::info!(
            leftovers = leftovers.len(),
            removed_empty,
            dir = %self.journal_dir.display(),
            "starting recovery"
        );

        let token = self.fatal.token();
        let ctx = TaskContext {
            releaser: self.pool.releaser(),
            fatal: self.fatal.clone(),
            telemetry: self.telemetry.clone(),
        };

        let mut replayed = Vec::with_capacity(leftovers.len());
        let mut handles = Vec::with_capacity(leftovers.len());
        let mut highest = None;
        for leftover in leftovers {
            let heights = leftover.record.replay_heights();
            highest = highest.max(Some(leftover.record.height()));
            let claim = LeftoverClaim::new(leftover.path.clone(), heights.len());

            for height in heights {
                let Some(worker) = self.pool.acquire_polling(self.poll_interval, &token).await
                else {
                    return Err(self.abort_error());
                };
                tracing::debug!(
                    worker = worker.id(),
                    height,
                    journal = %leftover.path.display(),
                    "replaying leftover height"
                );
                self.telemetry.record_recovered();
                handles.push(spawn_height_task(
                    ctx.clone(),
                    worker,
                    height,
                    Some(claim.clone()),
                ));
                replayed.push(height);
            }
        }

        join_all(handles).await;
        if self.fatal.is_triggered() {
            return Err(self.abort_error());
        }

        let resume_at = highest.map(|max: u64| max.saturating_add(1));
        tracing::info!(replayed = replayed.len(), resume_at = ?resume_at, "recovery finished");

        Ok(RecoveryOutcome {
            replayed,
            resume_at,
            removed_empty,
        })
    }

    fn abort_error(&self) -> SchedulerError {
        self.fatal.take_error().unwrap_or_else(|| {
            SchedulerError::setup("recovery", anyhow!("run was cancelled during recovery"))
        })
    }
}
