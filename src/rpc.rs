//! Stats-service plumbing: the service seam consumed by workers, and the
//! bitcoind JSON-RPC client implementing it (authentication, options, retry
//! policy).

pub mod auth;
pub mod client;
pub mod options;
pub mod retry;
pub mod stats;

pub use client::{AsyncRpcClient, RpcClientFactory, RpcError};
pub use options::RpcClientOptions;
pub use stats::{BlockStats, StatsService, StatsServiceFactory};
