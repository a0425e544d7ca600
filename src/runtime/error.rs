use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`SchedulerError`], stable enough for callers and
/// tests to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Service,
    Store,
    Journal,
    Panic,
}

/// Error surfaced by the scheduler. Every instance is considered fatal to the run.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("setup failed: {context}")]
    Setup {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stats service call failed{}", describe_height(*height))]
    Service {
        height: Option<u64>,
        #[source]
        source: anyhow::Error,
    },

    #[error("durable store rejected height {height}")]
    Store {
        height: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("progress journal I/O failed for {}", path.display())]
    Journal {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("task for height {height} panicked: {message}")]
    TaskPanicked { height: u64, message: String },
}

impl SchedulerError {
    pub fn setup(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Setup {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn service(height: Option<u64>, source: impl Into<anyhow::Error>) -> Self {
        Self::Service {
            height,
            source: source.into(),
        }
    }

    pub fn store(height: u64, source: impl Into<anyhow::Error>) -> Self {
        Self::Store {
            height,
            source: source.into(),
        }
    }

    pub fn journal(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Journal {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup { .. } => ErrorKind::Setup,
            Self::Service { .. } => ErrorKind::Service,
            Self::Store { .. } => ErrorKind::Store,
            Self::Journal { .. } => ErrorKind::Journal,
            Self::TaskPanicked { .. } => ErrorKind::Panic,
        }
    }

    /// Height the failure is attributed to, when there is one.
    pub fn height(&self) -> Option<u64> {
        match self {
            Self::Service { height, .. } => *height,
            Self::Store { height, .. } | Self::TaskPanicked { height, .. } => Some(*height),
            Self::Setup { .. } | Self::Journal { .. } => None,
        }
    }
}

fn describe_height(height: Option<u64>) -> String {
    match height {
        Some(height) => format!(" at height {height}"),
        None => String::new(),
    }
}
