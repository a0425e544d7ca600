use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Bounded exponential backoff used for durable-store writes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoundedBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl BoundedBackoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs `operation` until it succeeds or `max_attempts` is reached.
    ///
    /// `on_retry` is called before every sleep with the failed attempt number,
    /// the upcoming delay and the error. The last error is returned unchanged.
    pub(crate) async fn run<T, F, Fut, L>(&self, mut operation: F, mut on_retry: L) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        L: FnMut(usize, Duration, &anyhow::Error),
    {
        let mut attempt = 0;
        let mut delay = self.initial_delay;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    on_retry(attempt, delay, &err);
                    pause(delay).await;
                    delay = next_delay(delay, self.max_delay);
                }
            }
        }
    }
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        yield_now().await;
    } else {
        sleep(delay).await;
    }
}

fn next_delay(current: Duration, max_delay: Duration) -> Duration {
    if current.is_zero() {
        return max_delay.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_delay)
}
