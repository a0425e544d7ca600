use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIP_DISTANCE_THRESHOLD: u64 = 6;
pub const DEFAULT_JOURNAL_DIR: &str = "worker-progress";
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ACQUIRE_POLL_MS: u64 = 50;
const DEFAULT_TIP_POLL_MS: u64 = 500;
const DEFAULT_RECOVERY_POLL_MS: u64 = 100;
const DEFAULT_STORE_BATCH_SIZE: usize = 1;
const DEFAULT_STORE_MAX_ATTEMPTS: usize = 3;
const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_STORE_MAX_BACKOFF_MS: u64 = 2_000;

/// Immutable runtime configuration for a scheduler run.
///
/// All instances must be constructed via [`SchedulerConfig::builder`] or [`SchedulerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    worker_count: usize,
    start_height: Option<u64>,
    end_height: Option<u64>,
    tip_distance_threshold: u64,
    acquire_poll_interval: Duration,
    tip_poll_interval: Duration,
    recovery_poll_interval: Duration,
    journal_dir: PathBuf,
    recovery: bool,
    store_batch_size: usize,
    store_max_attempts: usize,
    store_retry_backoff: Duration,
    store_max_backoff: Duration,
    rpc_timeout: Duration,
    metrics_interval: Duration,
}

pub struct SchedulerConfigParams {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub worker_count: usize,
    pub start_height: Option<u64>,
    pub end_height: Option<u64>,
    pub tip_distance_threshold: u64,
    pub acquire_poll_interval: Duration,
    pub tip_poll_interval: Duration,
    pub recovery_poll_interval: Duration,
    pub journal_dir: PathBuf,
    pub recovery: bool,
    pub store_batch_size: usize,
    pub store_max_attempts: usize,
    pub store_retry_backoff: Duration,
    pub store_max_backoff: Duration,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
}

impl SchedulerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values and validates it.
    pub fn new(params: SchedulerConfigParams) -> Result<Self> {
        let SchedulerConfigParams {
            rpc_url,
            rpc_user,
            rpc_password,
            worker_count,
            start_height,
            end_height,
            tip_distance_threshold,
            acquire_poll_interval,
            tip_poll_interval,
            recovery_poll_interval,
            journal_dir,
            recovery,
            store_batch_size,
            store_max_attempts,
            store_retry_backoff,
            store_max_backoff,
            rpc_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            rpc_url: trimmed_string(rpc_url),
            rpc_user: trimmed_string(rpc_user),
            rpc_password: trimmed_string(rpc_password),
            worker_count,
            start_height,
            end_height,
            tip_distance_threshold,
            acquire_poll_interval,
            tip_poll_interval,
            recovery_poll_interval,
            journal_dir,
            recovery,
            store_batch_size,
            store_max_attempts,
            store_retry_backoff,
            store_max_backoff,
            rpc_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Full RPC URL (including scheme) of the stats service.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn rpc_user(&self) -> &str {
        &self.rpc_user
    }

    pub fn rpc_password(&self) -> &str {
        &self.rpc_password
    }

    /// Fixed worker pool capacity.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Explicit start height, or `None` to start `tip_distance_threshold` below the tip.
    pub fn start_height(&self) -> Option<u64> {
        self.start_height
    }

    /// Last height to dispatch, or `None` to keep following the tip.
    pub fn end_height(&self) -> Option<u64> {
        self.end_height
    }

    /// Distance to the tip at or below which dispatch is throttled.
    pub fn tip_distance_threshold(&self) -> u64 {
        self.tip_distance_threshold
    }

    /// Sleep between attempts to grab an idle worker.
    pub fn acquire_poll_interval(&self) -> Duration {
        self.acquire_poll_interval
    }

    /// Sleep between tip re-queries while throttled.
    pub fn tip_poll_interval(&self) -> Duration {
        self.tip_poll_interval
    }

    pub fn recovery_poll_interval(&self) -> Duration {
        self.recovery_poll_interval
    }

    pub fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    /// Whether leftover journals are replayed before dispatching.
    pub fn recovery(&self) -> bool {
        self.recovery
    }

    /// Records buffered per worker before a batch insert; `1` forwards each record immediately.
    pub fn store_batch_size(&self) -> usize {
        self.store_batch_size
    }

    pub fn store_max_attempts(&self) -> usize {
        self.store_max_attempts
    }

    pub fn store_retry_backoff(&self) -> Duration {
        self.store_retry_backoff
    }

    pub fn store_max_backoff(&self) -> Duration {
        self.store_max_backoff
    }

    /// Per-RPC timeout applied to the JSON-RPC client.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;
        ensure_not_empty(&self.rpc_user, "rpc_user")?;
        ensure_not_empty(&self.rpc_password, "rpc_password")?;

        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if let (Some(start), Some(end)) = (self.start_height, self.end_height) {
            if start > end {
                bail!("start_height ({start}) must not exceed end_height ({end})");
            }
        }

        if self.acquire_poll_interval.is_zero() {
            bail!("acquire_poll_interval must be greater than 0");
        }

        if self.tip_poll_interval.is_zero() {
            bail!("tip_poll_interval must be greater than 0");
        }

        if self.recovery_poll_interval.is_zero() {
            bail!("recovery_poll_interval must be greater than 0");
        }

        if self.journal_dir.as_os_str().is_empty() {
            bail!("journal_dir cannot be empty");
        }

        if self.store_batch_size == 0 {
            bail!("store_batch_size must be greater than 0");
        }

        if self.store_max_attempts == 0 {
            bail!("store_max_attempts must be greater than 0");
        }

        if self.store_max_backoff < self.store_retry_backoff {
            bail!("store_max_backoff must be at least store_retry_backoff");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerConfigBuilder {
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    worker_count: Option<usize>,
    start_height: Option<u64>,
    end_height: Option<u64>,
    tip_distance_threshold: Option<u64>,
    acquire_poll_interval: Option<Duration>,
    tip_poll_interval: Option<Duration>,
    recovery_poll_interval: Option<Duration>,
    journal_dir: Option<PathBuf>,
    recovery: bool,
    store_batch_size: Option<usize>,
    store_max_attempts: Option<usize>,
    store_retry_backoff: Option<Duration>,
    store_max_backoff: Option<Duration>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl SchedulerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_user(mut self, user: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self
    }

    pub fn rpc_password(mut self, password: impl Into<String>) -> Self {
        self.rpc_password = Some(password.into());
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    pub fn end_height(mut self, height: u64) -> Self {
        self.end_height = Some(height);
        self
    }

    pub fn tip_distance_threshold(mut self, distance: u64) -> Self {
        self.tip_distance_threshold = Some(distance);
        self
    }

    pub fn acquire_poll_interval(mut self, interval: Duration) -> Self {
        self.acquire_poll_interval = Some(interval);
        self
    }

    pub fn tip_poll_interval(mut self, interval: Duration) -> Self {
        self.tip_poll_interval = Some(interval);
        self
    }

    pub fn recovery_poll_interval(mut self, interval: Duration) -> Self {
        self.recovery_poll_interval = Some(interval);
        self
    }

    pub fn journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    pub fn store_batch_size(mut self, size: usize) -> Self {
        self.store_batch_size = Some(size);
        self
    }

    pub fn store_max_attempts(mut self, attempts: usize) -> Self {
        self.store_max_attempts = Some(attempts);
        self
    }

    pub fn store_retry_backoff(mut self, backoff: Duration) -> Self {
        self.store_retry_backoff = Some(backoff);
        self
    }

    pub fn store_max_backoff(mut self, backoff: Duration) -> Self {
        self.store_max_backoff = Some(backoff);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<SchedulerConfig> {
        let store_retry_backoff = self
            .store_retry_backoff
            .unwrap_or_else(|| Duration::from_millis(DEFAULT_STORE_RETRY_BACKOFF_MS));
        let params = SchedulerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_user: self.rpc_user.context("rpc_user is required")?,
            rpc_password: self.rpc_password.context("rpc_password is required")?,
            worker_count: self.worker_count.context("worker_count is required")?,
            start_height: self.start_height,
            end_height: self.end_height,
            tip_distance_threshold: self
                .tip_distance_threshold
                .unwrap_or(DEFAULT_TIP_DISTANCE_THRESHOLD),
            acquire_poll_interval: self
                .acquire_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_ACQUIRE_POLL_MS)),
            tip_poll_interval: self
                .tip_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_TIP_POLL_MS)),
            recovery_poll_interval: self
                .recovery_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_RECOVERY_POLL_MS)),
            journal_dir: self
                .journal_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_JOURNAL_DIR)),
            recovery: self.recovery,
            store_batch_size: self.store_batch_size.unwrap_or(DEFAULT_STORE_BATCH_SIZE),
            store_max_attempts: self
                .store_max_attempts
                .unwrap_or(DEFAULT_STORE_MAX_ATTEMPTS),
            store_retry_backoff,
            store_max_backoff: self.store_max_backoff.unwrap_or_else(|| {
                Duration::from_millis(DEFAULT_STORE_MAX_BACKOFF_MS).max(store_retry_backoff)
            }),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        SchedulerConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
