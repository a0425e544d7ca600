use crate::runtime::error::SchedulerError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Captures the first fatal error of a run and cancels the run token so the
/// dispatch loops stop assigning work.
///
/// Tasks that are already in flight are left alone: they either finish or are
/// torn down with the process.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    run_shutdown: CancellationToken,
    captured_error: Mutex<Option<SchedulerError>>,
}

impl FatalErrorHandler {
    pub fn new(run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                run_shutdown,
                captured_error: Mutex::new(None),
            }),
        }
    }

    /// Records `error` if it is the first one and cancels the run.
    ///
    /// Returns `true` when this call won the race.
    pub fn trigger(&self, error: SchedulerError) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                kind = ?error.kind(),
                error = %error,
                "suppressing secondary fatal error"
            );
            return false;
        }

        tracing::error!(
            kind = ?error.kind(),
            height = ?error.height(),
            error = %error,
            "fatal scheduler error; aborting run"
        );

        {
            let mut slot = self
                .inner
                .captured_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(error);
            }
        }

        self.inner.run_shutdown.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.run_shutdown.clone()
    }

    /// Takes the captured error out of the handler. Subsequent calls return `None`.
    pub fn take_error(&self) -> Option<SchedulerError> {
        self.inner
            .captured_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
