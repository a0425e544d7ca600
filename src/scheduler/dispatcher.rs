//! Main scheduling loop.
//!
//! The dispatcher walks an ascending cursor, binding each height to an idle
//! worker while the cursor is far enough below the tip (`Backfill`). Once the
//! distance to the tip drops to the threshold it stops assigning and instead
//! borrows a worker to re-query the tip (`TipThrottle`) until the tip has moved
//! far enough ahead again. With a finite end the loop drains in-flight tasks and
//! shuts the pool down once the cursor passes the end.

use crate::runtime::config::SchedulerConfig;
use crate::runtime::error::SchedulerError;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::task::{spawn_height_task, TaskContext};
use crate::scheduler::worker::Worker;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Backfill,
    TipThrottle,
    Draining,
    Done,
}

impl DispatchState {
    /// Throttles whenever the cursor is within `threshold` of the tip
    /// (including when it is already past the tip).
    pub fn classify(tip: u64, cursor: u64, threshold: u64) -> Self {
        if tip.saturating_sub(cursor) <= threshold {
            Self::TipThrottle
        } else {
            Self::Backfill
        }
    }
}

/// Outcome of a completed dispatch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub first_height: u64,
    /// Cursor value when the loop stopped, i.e. the first height not dispatched.
    pub next_height: u64,
    pub dispatched: u64,
    pub tip_polls: u64,
    pub last_tip: u64,
}

pub struct Dispatcher<'p> {
    pool: &'p mut WorkerPool,
    threshold: u64,
    acquire_poll_interval: Duration,
    tip_poll_interval: Duration,
    fatal: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
    state_tx: watch::Sender<DispatchState>,
}

impl<'p> Dispatcher<'p> {
    pub fn new(
        pool: &'p mut WorkerPool,
        config: &SchedulerConfig,
        fatal: FatalErrorHandler,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(DispatchState::Backfill);
        Self {
            pool,
            threshold: config.tip_distance_threshold(),
            acquire_poll_interval: config.acquire_poll_interval(),
            tip_poll_interval: config.tip_poll_interval(),
            fatal,
            telemetry,
            state_tx,
        }
    }

    /// Receiver that observes every state the dispatcher enters.
    pub fn state_watch(&self) -> watch::Receiver<DispatchState> {
        self.state_tx.subscribe()
    }

    /// Dispatches heights from `start` (or `threshold` below the tip when
    /// `None`) up to `end` inclusive, or forever when `end` is `None`.
    pub async fn run(
        &mut self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<DispatchSummary, SchedulerError> {
        let token = self.fatal.token();
        let ctx = TaskContext {
            releaser: self.pool.releaser(),
            fatal: self.fatal.clone(),
            telemetry: self.telemetry.clone(),
        };

        let mut tip = self.query_tip(&token).await?;
        let mut cursor = start.unwrap_or_else(|| tip.saturating_sub(self.threshold));
        let first_height = cursor;
        let mut dispatched = 0u64;
        let mut tip_polls = 0u64;
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        let mut state = DispatchState::classify(tip, cursor, self.threshold);
        self.publish(state);
        tracing::info!(
            cursor,
            tip,
            end = ?end,
            threshold = self.threshold,
            state = ?state,
            "dispatch started"
        );

        loop {
            if self.fatal.is_triggered() {
                return Err(self.abort_error());
            }
            if end.is_some_and(|end| cursor > end) {
                break;
            }

            match state {
                DispatchState::Backfill => {
                    let Some(worker) = self.acquire(&token).await else {
                        continue;
                    };
                    tracing::debug!(worker = worker.id(), height = cursor, "assigning height");
                    in_flight.retain(|handle| !handle.is_finished());
                    in_flight.push(spawn_height_task(ctx.clone(), worker, cursor, None));
                    cursor += 1;
                    dispatched += 1;
                }
                DispatchState::TipThrottle => {
                    let Some(worker) = self.acquire(&token).await else {
                        continue;
                    };
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(self.tip_poll_interval) => {}
                    }
                    let head = worker.current_head().await;
                    self.pool.release(worker);
                    tip_polls += 1;
                    self.telemetry.record_tip_poll();

                    match head {
                        Ok(head) => tip = head,
                        Err(err) => {
                            self.fatal.trigger(err);
                            continue;
                        }
                    }
                    tracing::trace!(tip, cursor, "tip polled while throttled");
                }
                DispatchState::Draining | DispatchState::Done => break,
            }

            let next = DispatchState::classify(tip, cursor, self.threshold);
            if next != state {
                self.telemetry.record_throttle_transition();
                tracing::info!(
                    from = ?state,
                    to = ?next,
                    tip,
                    cursor,
                    distance = tip.saturating_sub(cursor),
                    "dispatch state changed"
                );
                self.publish(next);
                state = next;
            }
        }

        self.publish(DispatchState::Draining);
        tracing::info!(in_flight = in_flight.len(), next = cursor, "draining in-flight heights");
        join_all(in_flight).await;

        if self.fatal.is_triggered() {
            return Err(self.abort_error());
        }

        self.pool.shutdown_all().await?;
        self.publish(DispatchState::Done);

        let summary = DispatchSummary {
            first_height,
            next_height: cursor,
            dispatched,
            tip_polls,
            last_tip: tip,
        };
        tracing::info!(
            first = summary.first_height,
            next = summary.next_height,
            dispatched = summary.dispatched,
            "dispatch finished"
        );
        Ok(summary)
    }

    async fn acquire(&mut self, token: &CancellationToken) -> Option<Worker> {
        self.pool
            .acquire_polling(self.acquire_poll_interval, token)
            .await
    }

    async fn query_tip(&mut self, token: &CancellationToken) -> Result<u64, SchedulerError> {
        let Some(worker) = self.acquire(token).await else {
            return Err(self.abort_error());
        };
        let head = worker.current_head().await;
        self.pool.release(worker);
        head
    }

    fn publish(&self, state: DispatchState) {
        self.state_tx.send_replace(state);
    }

    fn abort_error(&self) -> SchedulerError {
        self.fatal.take_error().unwrap_or_else(|| {
            SchedulerError::setup("dispatch", anyhow!("run was cancelled before dispatch completed"))
        })
    }
}

/// Waits for every handle; task failures are already routed to the fatal handler.
pub(crate) async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "height task did not complete");
        }
    }
}
