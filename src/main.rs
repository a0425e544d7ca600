use anyhow::{Context, Result};
use blocktally::runtime::config::DEFAULT_JOURNAL_DIR;
use blocktally::runtime::telemetry::init_tracing_with_default;
use blocktally::{
    JsonFileStore, MirroredStore, RpcClientFactory, Scheduler, SchedulerConfig, StatsStore,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Backfills and live-tails per-block statistics from a bitcoind node.
#[derive(Debug, Parser)]
#[command(name = "blocktally", version, about)]
struct Cli {
    /// Number of workers, each with its own RPC connection.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// First height to analyze. Defaults to a few blocks below the tip.
    #[arg(long)]
    start: Option<u64>,

    /// Last height to analyze. Omit to keep following the tip.
    #[arg(long)]
    end: Option<u64>,

    /// Replay heights recorded by a crashed run before dispatching.
    #[arg(long)]
    recovery: bool,

    /// Mirror stored records as JSON into the backup directory.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    json: bool,

    #[arg(long, default_value = "db")]
    store_dir: PathBuf,

    #[arg(long, default_value = "db-backup")]
    backup_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_JOURNAL_DIR)]
    journal_dir: PathBuf,

    /// Distance to the tip at or below which dispatch pauses.
    #[arg(long)]
    tip_distance: Option<u64>,

    /// Records buffered per worker before a batch insert.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Fallback log directive when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, env = "BITCOIND_HOST", default_value = "localhost:8332")]
    bitcoind_host: String,

    #[arg(long, env = "BITCOIND_USERNAME")]
    bitcoind_username: String,

    #[arg(long, env = "BITCOIND_PASSWORD", hide_env_values = true)]
    bitcoind_password: String,
}

impl Cli {
    fn rpc_url(&self) -> String {
        if self.bitcoind_host.contains("://") {
            self.bitcoind_host.clone()
        } else {
            format!("http://{}", self.bitcoind_host)
        }
    }

    fn config(&self) -> Result<SchedulerConfig> {
        let mut builder = SchedulerConfig::builder()
            .rpc_url(self.rpc_url())
            .rpc_user(&self.bitcoind_username)
            .rpc_password(&self.bitcoind_password)
            .worker_count(self.workers)
            .journal_dir(&self.journal_dir)
            .recovery(self.recovery);

        if let Some(start) = self.start {
            builder = builder.start_height(start);
        }
        if let Some(end) = self.end {
            builder = builder.end_height(end);
        }
        if let Some(distance) = self.tip_distance {
            builder = builder.tip_distance_threshold(distance);
        }
        if let Some(size) = self.batch_size {
            builder = builder.store_batch_size(size);
        }

        builder.build().context("invalid scheduler configuration")
    }

    fn store(&self) -> Result<Arc<dyn StatsStore>> {
        let primary = JsonFileStore::open(&self.store_dir)?;
        if self.json {
            Ok(Arc::new(MirroredStore::new(primary, &self.backup_dir)?))
        } else {
            Ok(Arc::new(primary))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_with_default(&cli.log_level);

    let config = cli.config()?;
    let store = cli.store()?;
    let factory = Arc::new(RpcClientFactory::new(config.clone()));

    let scheduler = Scheduler::new(config, factory, store);
    let report = scheduler.run().await.context("scheduler aborted")?;

    if let Some(recovery) = &report.recovery {
        tracing::info!(
            replayed = recovery.replayed.len(),
            resume_at = ?recovery.resume_at,
            "recovery summary"
        );
    }
    tracing::info!(
        run_tag = %report.run_tag,
        first = report.dispatch.first_height,
        next = report.dispatch.next_height,
        dispatched = report.dispatch.dispatched,
        stored = report.telemetry.stored_records,
        peak_busy_workers = report.telemetry.peak_busy_workers,
        "run complete"
    );
    Ok(())
}
