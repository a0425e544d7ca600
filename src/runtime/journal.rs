//! Per-worker progress journal used for crash recovery.
//!
//! Each worker owns one small file holding the last height whose result was
//! handed to the durable store. When the worker buffers results for a batch
//! insert, the file also lists the buffered heights so a crash before the
//! flush leaves them replayable. Every write replaces the whole file through a
//! synced temp file and a rename, so a reader sees either the previous record
//! or the new one and never residue from a longer earlier write.

use crate::runtime::error::SchedulerError;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE_PREFIX: &str = "worker-";
const CURRENT_KEY: &str = "last_block_analyzed";
const PENDING_KEY: &str = "pending";

/// Parsed content of a journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Range-style record written by older releases.
    Legacy { start: u64, last: u64, end: u64 },
    Current { last_block_analyzed: u64 },
    /// Heights buffered for a batch insert that had not reached the store,
    /// plus the last height that had.
    Buffered {
        last_block_analyzed: Option<u64>,
        pending: Vec<u64>,
    },
}

impl JournalRecord {
    /// Highest height the record mentions; recovery resumes right after it.
    pub fn height(&self) -> u64 {
        match self {
            Self::Legacy { last, .. } => *last,
            Self::Current {
                last_block_analyzed,
            } => *last_block_analyzed,
            Self::Buffered {
                last_block_analyzed,
                pending,
            } => pending
                .iter()
                .copied()
                .chain(*last_block_analyzed)
                .max()
                .unwrap_or_default(),
        }
    }

    /// Heights recovery must run again, one task each.
    pub fn replay_heights(&self) -> Vec<u64> {
        match self {
            Self::Buffered { pending, .. } => pending.clone(),
            other => vec![other.height()],
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Legacy { start, last, end } => format!("Start={start}\nLast={last}\nEnd={end}\n"),
            Self::Current {
                last_block_analyzed,
            } => format!("{CURRENT_KEY}={last_block_analyzed}\n"),
            Self::Buffered {
                last_block_analyzed,
                pending,
            } => {
                let pending = pending
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                match last_block_analyzed {
                    Some(last) => format!("{CURRENT_KEY}={last}\n{PENDING_KEY}={pending}\n"),
                    None => format!("{PENDING_KEY}={pending}\n"),
                }
            }
        }
    }

    /// Parses journal contents. Blank contents yield `Ok(None)`.
    pub fn parse(contents: &str) -> Result<Option<Self>> {
        let mut lines = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let Some(first) = lines.next() else {
            return Ok(None);
        };
        let (key, value) = split_entry(first)?;

        if key.eq_ignore_ascii_case(PENDING_KEY) {
            return Ok(Some(Self::Buffered {
                last_block_analyzed: None,
                pending: parse_pending(value)?,
            }));
        }

        if key.eq_ignore_ascii_case(CURRENT_KEY) {
            let last_block_analyzed = parse_height(key, value)?;
            // Anything after the first line other than a pending list is
            // left over from in-place writers and carries no meaning.
            let pending = lines
                .next()
                .and_then(|line| split_entry(line).ok())
                .filter(|(key, _)| key.eq_ignore_ascii_case(PENDING_KEY))
                .map(|(_, value)| parse_pending(value))
                .transpose()?;
            return Ok(Some(match pending {
                Some(pending) => Self::Buffered {
                    last_block_analyzed: Some(last_block_analyzed),
                    pending,
                },
                None => Self::Current {
                    last_block_analyzed,
                },
            }));
        }

        let mut start = None;
        let mut last = None;
        let mut end = None;
        for line in std::iter::once(first).chain(lines) {
            let (key, value) = split_entry(line)?;
            let slot = match key.to_ascii_lowercase().as_str() {
                "start" => &mut start,
                "last" => &mut last,
                "end" => &mut end,
                _ => bail!("unknown journal key {key:?}"),
            };
            *slot = Some(parse_height(key, value)?);
        }

        let last = last.context("legacy journal is missing its Last entry")?;
        Ok(Some(Self::Legacy {
            start: start.unwrap_or(last),
            last,
            end: end.unwrap_or(last),
        }))
    }
}

fn split_entry(line: &str) -> Result<(&str, &str)> {
    line.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
        .ok_or_else(|| anyhow!("journal line {line:?} is not key=value"))
}

fn parse_height(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("journal value for {key} is not a height: {value:?}"))
}

fn parse_pending(value: &str) -> Result<Vec<u64>> {
    let pending = value
        .split(',')
        .map(|height| parse_height(PENDING_KEY, height.trim()))
        .collect::<Result<Vec<_>>>()?;
    if pending.is_empty() {
        bail!("journal pending list is empty");
    }
    Ok(pending)
}

/// Journal file exclusively owned by one worker.
#[derive(Debug)]
pub struct ProgressJournal {
    path: PathBuf,
    last_recorded: Option<u64>,
}

impl ProgressJournal {
    /// Deterministic file name for `(run_tag, worker_id)`.
    pub fn file_name(run_tag: &str, worker_id: usize) -> String {
        format!("{JOURNAL_FILE_PREFIX}{run_tag}-{worker_id}")
    }

    /// Creates a fresh, empty journal. Fails if the file already exists so a new
    /// run can never clobber a leftover journal from a crashed one.
    pub fn create(dir: &Path, run_tag: &str, worker_id: usize) -> Result<Self, SchedulerError> {
        let path = dir.join(Self::file_name(run_tag, worker_id));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| SchedulerError::journal(&path, err))?;

        tracing::debug!(worker = worker_id, path = %path.display(), "created progress journal");

        Ok(Self {
            path,
            last_recorded: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last height recorded as handed to the store.
    pub fn last_recorded(&self) -> Option<u64> {
        self.last_recorded
    }

    /// Durably records `height` as the last height handed to the store, with
    /// nothing left in the batch buffer.
    pub async fn record(&mut self, height: u64) -> Result<(), SchedulerError> {
        self.replace(JournalRecord::Current {
            last_block_analyzed: height,
        })
        .await?;
        self.last_recorded = Some(height);
        Ok(())
    }

    /// Durably records heights that sit in the batch buffer and have not been
    /// handed to the store yet.
    pub async fn record_pending(&mut self, pending: Vec<u64>) -> Result<(), SchedulerError> {
        if pending.is_empty() {
            return match self.last_recorded {
                Some(height) => self.record(height).await,
                None => Ok(()),
            };
        }
        self.replace(JournalRecord::Buffered {
            last_block_analyzed: self.last_recorded,
            pending,
        })
        .await
    }

    async fn replace(&self, record: JournalRecord) -> Result<(), SchedulerError> {
        let path = self.path.clone();
        let contents = record.encode();
        tokio::task::spawn_blocking(move || replace_contents(&path, contents.as_bytes()))
            .await
            .map_err(|err| {
                SchedulerError::journal(&self.path, anyhow!("journal write task failed: {err}"))
            })?
            .map_err(|err| SchedulerError::journal(&self.path, err))
    }

    /// Reads and parses a journal file from disk.
    pub fn read_record(path: &Path) -> Result<Option<JournalRecord>, SchedulerError> {
        let contents =
            std::fs::read_to_string(path).map_err(|err| SchedulerError::journal(path, err))?;
        JournalRecord::parse(&contents).map_err(|err| SchedulerError::journal(path, err))
    }
}

fn replace_contents(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".journal-")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create journal temp file in {}", dir.display()))?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
