use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Same as [`init_tracing`] but with a caller-chosen fallback directive.
pub fn init_tracing_with_default(default_directive: &str) {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    dispatched_heights: AtomicU64,
    completed_heights: AtomicU64,
    stored_records: AtomicU64,
    store_retries: AtomicU64,
    tip_polls: AtomicU64,
    throttle_transitions: AtomicU64,
    recovered_heights: AtomicU64,
    busy_workers: AtomicUsize,
    peak_busy_workers: AtomicUsize,
}

impl Telemetry {
    pub fn record_dispatched(&self) {
        self.dispatched_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.stored_records.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tip_poll(&self) {
        self.tip_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle_transition(&self) {
        self.throttle_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovered(&self) {
        self.recovered_heights.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks one worker as bound to a task and updates the high-water mark.
    pub fn record_worker_bound(&self) {
        let busy = self.busy_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_busy_workers.fetch_max(busy, Ordering::SeqCst);
    }

    pub fn record_worker_released(&self) {
        let _ = self
            .busy_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |busy| {
                busy.checked_sub(1)
            });
    }

    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::SeqCst)
    }

    pub fn peak_busy_workers(&self) -> usize {
        self.peak_busy_workers.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            dispatched_heights: self.dispatched_heights.load(Ordering::Relaxed),
            completed_heights: self.completed_heights.load(Ordering::Relaxed),
            stored_records: self.stored_records.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            tip_polls: self.tip_polls.load(Ordering::Relaxed),
            throttle_transitions: self.throttle_transitions.load(Ordering::Relaxed),
            recovered_heights: self.recovered_heights.load(Ordering::Relaxed),
            busy_workers: self.busy_workers(),
            peak_busy_workers: self.peak_busy_workers(),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub dispatched_heights: u64,
    pub completed_heights: u64,
    pub stored_records: u64,
    pub store_retries: u64,
    pub tip_polls: u64,
    pub throttle_transitions: u64,
    pub recovered_heights: u64,
    pub busy_workers: usize,
    pub peak_busy_workers: usize,
}

/// Spawns a background task that periodically logs throughput and scheduler counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "blocktally::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let completed_delta = current
                        .completed_heights
                        .saturating_sub(last_snapshot.completed_heights);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        completed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "blocktally::metrics",
                        throughput = format!("{throughput:.2}"),
                        dispatched = current.dispatched_heights,
                        completed = current.completed_heights,
                        stored = current.stored_records,
                        store_retries = current.store_retries,
                        tip_polls = current.tip_polls,
                        busy_workers = current.busy_workers,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
