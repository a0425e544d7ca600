//! Stats-service seam consumed by workers, plus the `getblockstats` record it
//! returns.

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-block statistics as reported by bitcoind's `getblockstats`.
///
/// Fields the node adds beyond the well-known set are kept verbatim in `extra`
/// so patched nodes that report more statistics round-trip losslessly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStats {
    pub height: u64,
    pub blockhash: String,
    pub time: u64,
    pub mediantime: u64,
    pub txs: u64,
    pub ins: u64,
    pub outs: u64,
    pub subsidy: u64,
    pub totalfee: u64,
    pub total_out: u64,
    pub total_size: u64,
    pub total_weight: u64,
    pub avgfee: u64,
    pub avgfeerate: u64,
    pub avgtxsize: u64,
    pub minfee: u64,
    pub maxfee: u64,
    pub medianfee: u64,
    pub minfeerate: u64,
    pub maxfeerate: u64,
    pub feerate_percentiles: Vec<u64>,
    pub mintxsize: u64,
    pub maxtxsize: u64,
    pub mediantxsize: u64,
    pub swtxs: u64,
    pub swtotal_size: u64,
    pub swtotal_weight: u64,
    pub utxo_increase: i64,
    pub utxo_size_increase: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// External stats service. Each worker owns its own handle, so implementations
/// only need to be safe across distinct handles.
pub trait StatsService: Send + Sync {
    /// Current head height known to the service.
    fn current_head(&self) -> BoxFuture<'_, Result<u64>>;

    /// Statistics for the block at `height`.
    fn block_stats(&self, height: u64) -> BoxFuture<'_, Result<BlockStats>>;
}

/// Builds one service handle per worker during pool setup.
pub trait StatsServiceFactory: Send + Sync {
    fn connect(&self, worker_id: usize) -> Result<Box<dyn StatsService>>;
}

impl<F> StatsServiceFactory for F
where
    F: Fn(usize) -> Result<Box<dyn StatsService>> + Send + Sync,
{
    fn connect(&self, worker_id: usize) -> Result<Box<dyn StatsService>> {
        self(worker_id)
    }
}
