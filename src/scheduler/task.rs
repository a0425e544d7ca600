use crate::runtime::error::SchedulerError;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::pool::WorkerReleaser;
use crate::scheduler::worker::Worker;
use futures::FutureExt;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything a spawned height task needs besides the worker itself.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub releaser: WorkerReleaser,
    pub fatal: FatalErrorHandler,
    pub telemetry: Arc<Telemetry>,
}

/// Leftover journal being replayed. The file is removed once every height
/// replayed from it has completed.
#[derive(Debug)]
pub(crate) struct LeftoverClaim {
    path: PathBuf,
    outstanding: AtomicUsize,
}

impl LeftoverClaim {
    pub(crate) fn new(path: PathBuf, heights: usize) -> Arc<Self> {
        Arc::new(Self {
            path,
            outstanding: AtomicUsize::new(heights),
        })
    }

    fn complete(&self, height: u64) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            remove_leftover(&self.path, height);
        }
    }
}

/// Runs `height` on `worker` in its own task.
///
/// On success the worker goes back to the pool and, for replayed heights, the
/// leftover journal it came from is removed. Failures and panics are reported
/// to the fatal handler and the worker is not returned.
pub(crate) fn spawn_height_task(
    ctx: TaskContext,
    mut worker: Worker,
    height: u64,
    leftover: Option<Arc<LeftoverClaim>>,
) -> JoinHandle<()> {
    ctx.telemetry.record_dispatched();
    tokio::spawn(async move {
        let worker_id = worker.id();
        let result = std::panic::AssertUnwindSafe(worker.process_height(height))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                ctx.telemetry.record_completed();
                ctx.releaser.release(worker);
                if let Some(claim) = leftover {
                    claim.complete(height);
                }
            }
            Ok(Err(err)) => {
                tracing::error!(worker = worker_id, height, error = %err, "height task failed");
                ctx.fatal.trigger(err);
            }
            Err(panic_payload) => {
                let message = panic_message(panic_payload.as_ref());
                tracing::error!(worker = worker_id, height, panic = %message, "height task panicked");
                ctx.fatal
                    .trigger(SchedulerError::TaskPanicked { height, message });
            }
        }
    })
}

fn remove_leftover(path: &Path, height: u64) {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(height, path = %path.display(), "removed replayed journal");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                height,
                path = %path.display(),
                error = %err,
                "failed to remove replayed journal"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
