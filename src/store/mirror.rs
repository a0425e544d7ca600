use crate::store::json::JsonFileStore;
use crate::store::record::{StatsRecord, StatsStore};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;

/// Forwards every write to an inner store and, once the inner store accepted
/// it, mirrors the record as a JSON backup document.
pub struct MirroredStore<S> {
    inner: S,
    backup: JsonFileStore,
}

impl<S: StatsStore> MirroredStore<S> {
    pub fn new(inner: S, backup_dir: impl Into<PathBuf>) -> Result<Self> {
        let backup = JsonFileStore::open(backup_dir).context("failed to open JSON backup")?;
        Ok(Self { inner, backup })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn backup(&self) -> &JsonFileStore {
        &self.backup
    }
}

impl<S: StatsStore> StatsStore for MirroredStore<S> {
    fn insert_one<'a>(&'a self, record: &'a StatsRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.inner.insert_one(record).await?;
            self.backup
                .write(std::slice::from_ref(record))
                .await
                .with_context(|| format!("failed to mirror height {}", record.height()))
        })
    }

    fn insert_batch<'a>(&'a self, records: &'a [StatsRecord]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.inner.insert_batch(records).await?;
            self.backup
                .write(records)
                .await
                .with_context(|| format!("failed to mirror {} records", records.len()))
        })
    }
}
