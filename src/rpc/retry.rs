//! Per-call retry bookkeeping for the RPC client: which method is being
//! retried, for which height, and how each attempt is reported.

use anyhow::Error;
use std::time::Duration;

/// Identifies one logical RPC call across its retry attempts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallSite {
    pub(crate) method: &'static str,
    pub(crate) height: Option<u64>,
}

impl CallSite {
    pub(crate) fn tip() -> Self {
        Self {
            method: "getblockcount",
            height: None,
        }
    }

    pub(crate) fn block_stats(height: u64) -> Self {
        Self {
            method: "getblockstats",
            height: Some(height),
        }
    }

    pub(crate) fn log_timeout(&self, attempt: usize, backoff: Duration) {
        tracing::warn!(
            method = self.method,
            height = ?self.height,
            attempt,
            backoff_ms = millis(backoff),
            "rpc call timed out; retrying"
        );
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error) {
        tracing::warn!(
            method = self.method,
            height = ?self.height,
            attempt,
            backoff_ms = millis(backoff),
            error = %err,
            "rpc call failed; retrying"
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        tracing::error!(
            method = self.method,
            height = ?self.height,
            attempt,
            error = %err,
            "rpc call exhausted retries"
        );
    }

    pub(crate) fn log_out_of_range(&self) {
        tracing::info!(
            method = self.method,
            height = ?self.height,
            "requested height is above the node tip"
        );
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
