//! Filesystem store writing one JSON document per height.

use crate::store::record::{StatsRecord, StatsStore};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stores each record as `<dir>/<height>.json`.
///
/// Writes go through a temp file in the same directory that is then persisted
/// over the target, so readers never observe a half-written document and a
/// re-delivered height simply replaces the previous copy.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens the store, creating `dir` when missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, height: u64) -> PathBuf {
        self.dir.join(format!("{height}.json"))
    }

    /// Reads back a stored record, or `None` if the height was never written.
    pub fn load(&self, height: u64) -> Result<Option<StatsRecord>> {
        let path = self.record_path(height);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let record = serde_json::from_slice(&contents)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        Ok(Some(record))
    }

    /// Encodes `records` and writes them on the blocking pool.
    pub(crate) async fn write(&self, records: &[StatsRecord]) -> Result<()> {
        let documents = records
            .iter()
            .map(|record| {
                let json = serde_json::to_vec_pretty(record).with_context(|| {
                    format!("failed to encode record for height {}", record.height())
                })?;
                Ok((record.height(), json))
            })
            .collect::<Result<Vec<_>>>()?;
        if documents.is_empty() {
            return Ok(());
        }

        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            documents
                .iter()
                .try_for_each(|(height, json)| store.persist(*height, json))
        })
        .await
        .context("JSON store write task failed")?
    }

    fn persist(&self, height: u64, json: &[u8]) -> Result<()> {
        let path = self.record_path(height);
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp file in {}", self.dir.display()))?;
        temp.write_all(json)
            .context("failed to write record to temp file")?;
        temp.as_file()
            .sync_all()
            .context("failed to sync record temp file")?;
        temp.persist(&path)
            .with_context(|| format!("failed to persist {}", path.display()))?;

        tracing::trace!(height, path = %path.display(), "stored record");
        Ok(())
    }
}

impl StatsStore for JsonFileStore {
    fn insert_one<'a>(&'a self, record: &'a StatsRecord) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(std::slice::from_ref(record)))
    }

    fn insert_batch<'a>(&'a self, records: &'a [StatsRecord]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(records))
    }
}
