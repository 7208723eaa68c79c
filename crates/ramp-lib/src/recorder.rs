//! Run recording
//!
//! A run directory holds:
//! - `cycles.jsonl`: one [`CycleRecord`] per line, append-only
//! - `state.json`: the latest [`RunState`], replaced atomically
//! - `summary.json`: the [`RunSummary`], written once at the end
//!
//! Readers (the CLI, a crashed run's operator) never observe a torn
//! `state.json` or `summary.json`.

use crate::models::{CycleRecord, RunState, RunSummary};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const CYCLES_FILE: &str = "cycles.jsonl";
pub const STATE_FILE: &str = "state.json";
pub const SUMMARY_FILE: &str = "summary.json";

/// Sink for everything a run produces
pub trait RunRecorder: Send + Sync {
    /// Append one evaluated cycle
    fn record_cycle(&self, record: &CycleRecord) -> Result<()>;

    /// Persist the latest run state
    fn record_state(&self, state: &RunState) -> Result<()>;

    /// Persist the final summary
    fn finish(&self, summary: &RunSummary) -> Result<()>;
}

/// Recorder writing into a run directory
pub struct FileRecorder {
    dir: PathBuf,
    cycles: Mutex<File>,
}

impl FileRecorder {
    /// Open (or create) a run directory
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create run directory {:?}", dir))?;

        let path = dir.join(CYCLES_FILE);
        let cycles = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        Ok(Self {
            dir,
            cycles: Mutex::new(cycles),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl RunRecorder for FileRecorder {
    fn record_cycle(&self, record: &CycleRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to serialize cycle record")?;
        line.push(b'\n');

        let mut file = match self.cycles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line)
            .context("Failed to append cycle record")?;
        file.sync_data().context("Failed to sync cycle log")?;

        debug!(cycle = record.cycle_index, "Cycle recorded");
        Ok(())
    }

    fn record_state(&self, state: &RunState) -> Result<()> {
        write_atomic(&self.dir.join(STATE_FILE), state)
    }

    fn finish(&self, summary: &RunSummary) -> Result<()> {
        write_atomic(&self.dir.join(SUMMARY_FILE), summary)?;
        debug!(dir = %self.dir.display(), "Run summary written");
        Ok(())
    }
}

/// Serialize `value` to `path` via a temp file and rename
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec_pretty(value).context("Failed to serialize")?;

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(&json)
        .with_context(|| format!("Failed to write {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}

/// Recorder that keeps everything in memory
#[derive(Default)]
pub struct MemoryRecorder {
    inner: Mutex<RecordedRun>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of what has been recorded so far
    pub fn snapshot(&self) -> RecordedRun {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with<F: FnOnce(&mut RecordedRun)>(&self, f: F) {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl RunRecorder for MemoryRecorder {
    fn record_cycle(&self, record: &CycleRecord) -> Result<()> {
        self.with(|run| run.cycles.push(record.clone()));
        Ok(())
    }

    fn record_state(&self, state: &RunState) -> Result<()> {
        self.with(|run| run.state = Some(state.clone()));
        Ok(())
    }

    fn finish(&self, summary: &RunSummary) -> Result<()> {
        self.with(|run| run.summary = Some(summary.clone()));
        Ok(())
    }
}

/// A run as read back from disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedRun {
    pub cycles: Vec<CycleRecord>,
    pub state: Option<RunState>,
    pub summary: Option<RunSummary>,
}

/// Read a run directory
///
/// A trailing line that does not parse (a write cut short by a crash) is
/// skipped; a bad line anywhere else is an error.
pub fn load_run(dir: &Path) -> Result<RecordedRun> {
    if !dir.is_dir() {
        anyhow::bail!("Run directory {:?} does not exist", dir);
    }

    let cycles_path = dir.join(CYCLES_FILE);
    let mut cycles = Vec::new();
    if cycles_path.exists() {
        let file = File::open(&cycles_path)
            .with_context(|| format!("Failed to open {:?}", cycles_path))?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Failed to read {:?}", cycles_path))?;
        let last = lines.len().saturating_sub(1);

        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CycleRecord>(line) {
                Ok(record) => cycles.push(record),
                Err(e) if n == last => {
                    warn!(line = n + 1, error = %e, "Skipping truncated final cycle record");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Corrupt cycle record at {:?} line {}", cycles_path, n + 1)
                    })
                }
            }
        }
    }

    Ok(RecordedRun {
        cycles,
        state: read_optional(&dir.join(STATE_FILE))?,
        summary: read_optional(&dir.join(SUMMARY_FILE))?,
    })
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(Some(value))
}
