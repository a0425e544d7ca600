use std::{
    collections::HashSet,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use blocktally::{
    BlockStats, SchedulerConfig, SchedulerConfigBuilder, StatsRecord, StatsService,
    StatsServiceFactory, StatsStore,
};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Config builder with short poll intervals, pointed at `journal_dir`.
pub fn test_config(journal_dir: &Path, workers: usize) -> SchedulerConfigBuilder {
    SchedulerConfig::builder()
        .rpc_url("http://127.0.0.1:18443")
        .rpc_user("user")
        .rpc_password("pass")
        .worker_count(workers)
        .journal_dir(journal_dir)
        .acquire_poll_interval(Duration::from_millis(2))
        .tip_poll_interval(Duration::from_millis(10))
        .recovery_poll_interval(Duration::from_millis(2))
        .store_retry_backoff(Duration::from_millis(1))
        .store_max_backoff(Duration::from_millis(2))
        .metrics_interval(Duration::from_millis(50))
}

/// In-memory stand-in for a node: a movable tip plus per-height failure
/// injection. Every worker handle created by [`MockNode::factory`] shares it.
#[derive(Clone, Default)]
pub struct MockNode {
    inner: Arc<MockNodeInner>,
}

#[derive(Default)]
struct MockNodeInner {
    tip: AtomicU64,
    head_calls: AtomicU64,
    connections: AtomicUsize,
    stats_delay_ms: AtomicU64,
    failing_heights: Mutex<HashSet<u64>>,
    panicking_heights: Mutex<HashSet<u64>>,
    stats_calls: Mutex<Vec<u64>>,
}

impl MockNode {
    pub fn with_tip(tip: u64) -> Self {
        let node = Self::default();
        node.set_tip(tip);
        node.set_stats_delay(Duration::from_millis(5));
        node
    }

    pub fn set_tip(&self, tip: u64) {
        self.inner.tip.store(tip, Ordering::SeqCst);
    }

    pub fn set_stats_delay(&self, delay: Duration) {
        self.inner
            .stats_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_height(&self, height: u64) {
        self.inner.failing_heights.lock().unwrap().insert(height);
    }

    pub fn panic_at(&self, height: u64) {
        self.inner.panicking_heights.lock().unwrap().insert(height);
    }

    pub fn head_calls(&self) -> u64 {
        self.inner.head_calls.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Heights requested so far, sorted.
    pub fn stats_calls(&self) -> Vec<u64> {
        let mut calls = self.inner.stats_calls.lock().unwrap().clone();
        calls.sort_unstable();
        calls
    }

    pub fn factory(&self) -> Arc<dyn StatsServiceFactory> {
        let node = self.clone();
        Arc::new(move |worker_id: usize| -> Result<Box<dyn StatsService>> {
            node.inner.connections.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockStatsService {
                node: node.clone(),
                worker_id,
            }))
        })
    }
}

struct MockStatsService {
    node: MockNode,
    worker_id: usize,
}

impl StatsService for MockStatsService {
    fn current_head(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.node.inner.head_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.node.inner.tip.load(Ordering::SeqCst))
        })
    }

    fn block_stats(&self, height: u64) -> BoxFuture<'_, Result<BlockStats>> {
        Box::pin(async move {
            let inner = &self.node.inner;
            let delay = inner.stats_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                sleep(Duration::from_millis(delay)).await;
            }
            if inner.panicking_heights.lock().unwrap().contains(&height) {
                panic!("mock node crashed at height {height}");
            }
            if inner.failing_heights.lock().unwrap().contains(&height) {
                bail!("worker {} could not reach node for height {height}", self.worker_id);
            }
            if height > inner.tip.load(Ordering::SeqCst) {
                bail!("height {height} is above the mock tip");
            }

            inner.stats_calls.lock().unwrap().push(height);
            Ok(BlockStats {
                height,
                blockhash: format!("{height:064x}"),
                txs: height % 7 + 1,
                ..BlockStats::default()
            })
        })
    }
}

/// Store that keeps the heights it receives and can be told to reject writes.
#[derive(Default)]
pub struct RecordingStore {
    heights: Mutex<Vec<u64>>,
    batches: Mutex<Vec<Vec<u64>>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every stored height, sorted, duplicates kept.
    pub fn heights(&self) -> Vec<u64> {
        let mut heights = self.heights.lock().unwrap().clone();
        heights.sort_unstable();
        heights
    }

    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches.lock().unwrap().clone()
    }

    fn accept(&self, records: &[StatsRecord]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("store rejected {} record(s)", records.len()));
        }
        self.heights
            .lock()
            .unwrap()
            .extend(records.iter().map(StatsRecord::height));
        Ok(())
    }
}

impl StatsStore for RecordingStore {
    fn insert_one<'a>(&'a self, record: &'a StatsRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.accept(std::slice::from_ref(record)) })
    }

    fn insert_batch<'a>(&'a self, records: &'a [StatsRecord]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.accept(records)?;
            self.batches
                .lock()
                .unwrap()
                .push(records.iter().map(StatsRecord::height).collect());
            Ok(())
        })
    }
}

pub async fn wait_until<F>(mut condition: F, timeout: Duration, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub fn write_journal(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("journal fixture must be writable");
    path
}

pub fn assert_each_once(heights: &[u64], expected: impl IntoIterator<Item = u64>) {
    let expected: Vec<u64> = expected.into_iter().collect();
    assert_eq!(
        heights, expected,
        "every height must be delivered exactly once"
    );
}
