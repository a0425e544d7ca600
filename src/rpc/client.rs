//! RPC client implementation of the stats service for bitcoind's JSON-RPC
//! interface. Houses the `AsyncRpcClient`, its error type, and the factory the
//! worker pool uses to give every worker its own handle.

use crate::rpc::auth::build_auth_headers;
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::CallSite;
use crate::rpc::stats::{BlockStats, StatsService, StatsServiceFactory};
use crate::runtime::config::SchedulerConfig;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};

/// bitcoind reports `RPC_INVALID_PARAMETER` for heights above its tip.
const RPC_INVALID_PARAMETER: i32 = -8;

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    HeightOutOfRange { height: u64 },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::HeightOutOfRange { height } => {
                write!(f, "requested height {height} is above the current tip")
            }
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone)]
pub struct AsyncRpcClient {
    rpc_url: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
}

impl StatsService for AsyncRpcClient {
    fn current_head(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.get_block_count())
    }

    fn block_stats(&self, height: u64) -> BoxFuture<'_, Result<BlockStats>> {
        Box::pin(self.get_block_stats(height))
    }
}

impl AsyncRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::with_options(url, user, password, RpcClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        options: RpcClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let headers = build_auth_headers(&user.into(), &password.into())?;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            client,
            options,
        })
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let options = RpcClientOptions {
            request_timeout: config.rpc_timeout(),
            ..RpcClientOptions::default()
        };
        Self::with_options(
            config.rpc_url().to_owned(),
            config.rpc_user().to_owned(),
            config.rpc_password().to_owned(),
            options,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    /// Current tip height as reported by `getblockcount`.
    pub async fn get_block_count(&self) -> Result<u64> {
        let site = CallSite::tip();
        self.retry_request(site, || self.call(site, rpc_params![]))
            .await
    }

    pub async fn get_block_stats(&self, height: u64) -> Result<BlockStats> {
        let site = CallSite::block_stats(height);
        self.retry_request(site, || self.call(site, rpc_params![height]))
            .await
    }

    /// Shared retry/backoff loop that wraps RPC operations with exponential
    /// backoff and consistent logging. Out-of-range heights are never retried.
    async fn retry_request<T, F, Fut>(&self, site: CallSite, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match operation().await {
                Ok(value) => {
                    tracing::trace!(method = site.method, attempt, "rpc call completed");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(RpcError::HeightOutOfRange { .. }) = err.downcast_ref::<RpcError>() {
                site.log_out_of_range();
                return Err(err);
            }

            if attempt >= self.options.max_attempts {
                site.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = self.backoff_delay(attempt);
            if let Some(RpcError::Timeout { .. }) = err.downcast_ref::<RpcError>() {
                site.log_timeout(attempt, backoff);
            } else {
                site.log_retry(attempt, backoff, &err);
            }
            sleep(backoff).await;
        }
    }

    async fn call<R>(&self, site: CallSite, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let method = site.method;
        timeout(
            self.options.request_timeout,
            self.client.request::<R, _>(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| map_rpc_error(site, err))
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.options.initial_backoff;
        }

        let exponent = attempt.saturating_sub(1) as u32;
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self.options.initial_backoff.saturating_mul(multiplier);

        delay.min(self.options.max_backoff)
    }
}

fn map_rpc_error(site: CallSite, err: JsonRpcError) -> anyhow::Error {
    let method = site.method;
    match (&err, site.height) {
        (JsonRpcError::Call(call_err), Some(height))
            if call_err.code() == RPC_INVALID_PARAMETER =>
        {
            RpcError::HeightOutOfRange { height }.into()
        }
        (JsonRpcError::Call(call_err), _) => anyhow!(
            "{method} rejected by node (code={}, message={})",
            call_err.code(),
            call_err.message()
        ),
        _ => anyhow!("{method} transport failure: {err}"),
    }
}

/// Hands every worker its own [`AsyncRpcClient`] built from the scheduler config.
#[derive(Debug, Clone)]
pub struct RpcClientFactory {
    config: SchedulerConfig,
}

impl RpcClientFactory {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }
}

impl StatsServiceFactory for RpcClientFactory {
    fn connect(&self, worker_id: usize) -> Result<Box<dyn StatsService>> {
        let client = AsyncRpcClient::from_config(&self.config)?;
        tracing::debug!(worker = worker_id, endpoint = client.endpoint(), "connected stats service");
        Ok(Box::new(client))
    }
}
