pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use rpc::{
    AsyncRpcClient, BlockStats, RpcClientFactory, RpcClientOptions, RpcError, StatsService,
    StatsServiceFactory,
};
pub use runtime::config::{SchedulerConfig, SchedulerConfigBuilder, SchedulerConfigParams};
pub use runtime::error::{ErrorKind, SchedulerError};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::journal::{JournalRecord, ProgressJournal};
pub use runtime::runner::{Scheduler, SchedulerReport};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::{
    DispatchState, DispatchSummary, Dispatcher, RecoveryCoordinator, RecoveryOutcome, Worker,
    WorkerPool, WorkerReleaser,
};
pub use store::{JsonFileStore, MirroredStore, StatsRecord, StatsStore, CURRENT_VERSION};
