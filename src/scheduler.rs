//! Scheduling core: workers, the pool they are handed around in, the
//! dispatch state machine and crash recovery.

pub(crate) mod backoff;
pub mod dispatcher;
pub mod pool;
pub mod recovery;
pub(crate) mod task;
pub mod worker;

pub use dispatcher::{DispatchState, DispatchSummary, Dispatcher};
pub use pool::{WorkerPool, WorkerReleaser};
pub use recovery::{LeftoverJournal, RecoveryCoordinator, RecoveryOutcome};
pub use worker::Worker;
