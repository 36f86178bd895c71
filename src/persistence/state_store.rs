//! Durable status file and append-only JSON-lines logs
//!
//! All file I/O is blocking and is moved onto the blocking pool so the
//! detection and shutdown tasks stay responsive.

use super::file_lock::FileLock;
use super::status::PersistedStatus;
use crate::error::{Result, TripwireError};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATUS_FILE: &str = "status.json";
pub const EVENT_LOG_FILE: &str = "events.jsonl";
pub const PROTECTION_LOG_FILE: &str = "protections.jsonl";
const STATUS_LOCK: &str = "status";

/// File-backed store shared by the detector and the shutdown controller
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a state directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!("State store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.dir.join(EVENT_LOG_FILE)
    }

    pub fn protection_log_path(&self) -> PathBuf {
        self.dir.join(PROTECTION_LOG_FILE)
    }

    /// Path of the advisory lock file for a subsystem
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// Read the persisted status; a missing or empty file yields the default
    pub async fn load_status(&self) -> Result<PersistedStatus> {
        let path = self.status_path();
        tokio::task::spawn_blocking(move || read_status(&path)).await?
    }

    /// Read-modify-write the status under the status lock.
    ///
    /// An unparsable status file is replaced, starting from a stopped state.
    pub async fn update_status<F>(&self, mutate: F) -> Result<PersistedStatus>
    where
        F: FnOnce(&mut PersistedStatus) + Send + 'static,
    {
        let path = self.status_path();
        let lock_path = self.lock_path(STATUS_LOCK);
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire(&lock_path)?;
            let mut status = read_status_or_stopped(&path)?;
            mutate(&mut status);
            status.updated_at = Some(Utc::now());
            write_status_atomic(&path, &status)?;
            Ok(status)
        })
        .await?
    }

    /// Append one entry to the event log
    pub async fn append_event(&self, entry: Value) -> Result<()> {
        let path = self.event_log_path();
        tokio::task::spawn_blocking(move || append_line(&path, entry)).await?
    }

    /// Append one entry to the protection log
    pub async fn append_protection(&self, entry: Value) -> Result<()> {
        let path = self.protection_log_path();
        tokio::task::spawn_blocking(move || append_line(&path, entry)).await?
    }

    /// Read every event log entry back, skipping unparsable lines
    pub async fn read_events(&self) -> Result<Vec<Value>> {
        let path = self.event_log_path();
        tokio::task::spawn_blocking(move || read_lines(&path)).await?
    }

    /// Read every protection log entry back
    pub async fn read_protections(&self) -> Result<Vec<Value>> {
        let path = self.protection_log_path();
        tokio::task::spawn_blocking(move || read_lines(&path)).await?
    }
}

fn read_status(path: &Path) -> Result<PersistedStatus> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(PersistedStatus::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedStatus::default()),
        Err(e) => Err(e.into()),
    }
}

fn read_status_or_stopped(path: &Path) -> Result<PersistedStatus> {
    match read_status(path) {
        Err(TripwireError::Json(e)) => {
            warn!("Status file {} is corrupt, rewriting it: {}", path.display(), e);
            Ok(PersistedStatus {
                system_running: false,
                ..Default::default()
            })
        }
        other => other,
    }
}

/// Write to a sibling temp file then rename over the target
fn write_status_atomic(path: &Path, status: &PersistedStatus) -> Result<()> {
    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let bytes = serde_json::to_vec_pretty(status)?;
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn append_line(path: &Path, entry: Value) -> Result<()> {
    let entry = stamp(entry);
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn stamp(entry: Value) -> Value {
    match entry {
        Value::Object(mut map) => {
            map.entry("timestamp")
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
            Value::Object(map)
        }
        other => json!({
            "timestamp": Utc::now().to_rfc3339(),
            "details": other,
        }),
    }
}

fn read_lines(path: &Path) -> Result<Vec<Value>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => entries.push(value),
            Err(e) => warn!("Skipping malformed line {} in {}: {}", idx + 1, path.display(), e),
        }
    }
    Ok(entries)
}
