use crate::rpc::stats::StatsServiceFactory;
use crate::runtime::config::SchedulerConfig;
use crate::runtime::error::SchedulerError;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry, TelemetrySnapshot};
use crate::scheduler::dispatcher::{DispatchSummary, Dispatcher};
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::store::record::StatsStore;
use anyhow::anyhow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Format of the per-run tag embedded in journal file names.
const RUN_TAG_FORMAT: &str = "%m-%d_%H%M%S%3f";

#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub run_tag: String,
    pub recovery: Option<RecoveryOutcome>,
    pub dispatch: DispatchSummary,
    pub telemetry: TelemetrySnapshot,
}

/// Wires pool setup, optional recovery and dispatch into one run.
pub struct Scheduler {
    config: SchedulerConfig,
    factory: Arc<dyn StatsServiceFactory>,
    store: Arc<dyn StatsStore>,
    telemetry: Arc<Telemetry>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        factory: Arc<dyn StatsServiceFactory>,
        store: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            config,
            factory,
            store,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Shared counters; usable while [`Self::run`] is in progress.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Runs until the configured end height has been processed, or until the
    /// first fatal error.
    pub async fn run(&self) -> Result<SchedulerReport, SchedulerError> {
        let reporter_shutdown = CancellationToken::new();
        let reporter = spawn_metrics_reporter(
            self.telemetry.clone(),
            reporter_shutdown.clone(),
            self.config.metrics_interval(),
        );

        let result = self.execute().await;

        reporter_shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter did not shut down cleanly");
        }
        result
    }

    async fn execute(&self) -> Result<SchedulerReport, SchedulerError> {
        let journal_dir = self.config.journal_dir();
        std::fs::create_dir_all(journal_dir).map_err(|err| {
            SchedulerError::setup(
                format!("journal directory {}", journal_dir.display()),
                err,
            )
        })?;

        let run_tag = chrono::Local::now().format(RUN_TAG_FORMAT).to_string();
        let fatal = FatalErrorHandler::new(CancellationToken::new());
        let mut pool = WorkerPool::setup(
            &self.config,
            self.factory.as_ref(),
            self.store.clone(),
            &run_tag,
            self.telemetry.clone(),
        )?;

        self.check_range(&mut pool, &fatal).await?;

        let recovery = if self.config.recovery() {
            let outcome = RecoveryCoordinator::new(
                &mut pool,
                &self.config,
                fatal.clone(),
                self.telemetry.clone(),
            )
            .run()
            .await?;
            Some(outcome)
        } else {
            None
        };

        let start = recovery
            .as_ref()
            .and_then(|outcome| outcome.resume_at)
            .or(self.config.start_height());

        let dispatch = Dispatcher::new(&mut pool, &self.config, fatal, self.telemetry.clone())
            .run(start, self.config.end_height())
            .await?;

        Ok(SchedulerReport {
            run_tag,
            recovery,
            dispatch,
            telemetry: self.telemetry.snapshot(),
        })
    }

    /// Refuses explicit heights the node has not reached yet.
    async fn check_range(
        &self,
        pool: &mut WorkerPool,
        fatal: &FatalErrorHandler,
    ) -> Result<(), SchedulerError> {
        let start = self.config.start_height();
        let end = self.config.end_height();
        if start.is_none() && end.is_none() {
            return Ok(());
        }

        let Some(worker) = pool
            .acquire_polling(self.config.acquire_poll_interval(), &fatal.token())
            .await
        else {
            return Err(SchedulerError::setup(
                "range check",
                anyhow!("no worker available to query the tip"),
            ));
        };
        let tip = worker.current_head().await;
        pool.release(worker);
        let tip = tip?;

        let beyond_tip = [start, end].into_iter().flatten().find(|height| *height > tip);
        if let Some(height) = beyond_tip {
            return Err(SchedulerError::setup(
                "range check",
                anyhow!("node tip is {tip}; height {height} has not been reached yet"),
            ));
        }
        Ok(())
    }
}
