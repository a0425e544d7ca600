//! Durable-store seam and the versioned record envelope handed to it.

use crate::rpc::stats::BlockStats;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Schema version stamped on every record produced by this build.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub version: u32,
    pub stats: BlockStats,
}

impl StatsRecord {
    pub fn new(stats: BlockStats) -> Self {
        Self {
            version: CURRENT_VERSION,
            stats,
        }
    }

    pub fn height(&self) -> u64 {
        self.stats.height
    }
}

/// Durable store collaborator.
///
/// The scheduler delivers records at least once and in no particular order, so
/// implementations must tolerate both duplicates and out-of-order heights.
pub trait StatsStore: Send + Sync {
    fn insert_one<'a>(&'a self, record: &'a StatsRecord) -> BoxFuture<'a, Result<()>>;

    fn insert_batch<'a>(&'a self, records: &'a [StatsRecord]) -> BoxFuture<'a, Result<()>>;
}
