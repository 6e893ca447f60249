//! Append-only JSON-lines journals and atomic snapshot persistence.
//!
//! Journals are the only durable output of the simulator. Appends are
//! line-atomic (one serialized record plus newline under an interior mutex),
//! and the best-effort variants never propagate I/O failures into the caller:
//! a failed append degrades to a `tracing` warning and a metrics counter so
//! node and orchestrator state stay untouched.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

/// An append-only JSON-lines sink backed by a file.
///
/// The file is created eagerly on open so consumers tailing the journal see
/// it exist before the first record lands.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Opens (creating if needed) the journal at `path` for appending.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The file this journal appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns serialization or write errors; the caller decides whether the
    /// failure matters.
    pub fn append<T: Serialize>(&self, record: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)
    }

    /// Appends one record, swallowing any failure.
    ///
    /// Journalling must never corrupt or abort the operation that produced
    /// the record; failures surface as a warning and a counter instead.
    pub fn append_best_effort<T: Serialize>(&self, record: &T) {
        if let Err(err) = self.append(record) {
            metrics::counter!("courier_journal_append_failures_total").increment(1);
            tracing::warn!(path = %self.path.display(), %err, "journal append failed");
        }
    }
}

/// Persists a value as pretty-printed JSON via write-temp-then-rename.
///
/// The rename makes the update atomic on POSIX filesystems: readers see
/// either the old document or the new one, never a partial write.
///
/// # Errors
///
/// Returns serialization or I/O errors from the write or the rename.
pub fn persist_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)
}

/// Reads a JSON-lines file, returning the records that parse.
///
/// Missing files read as empty; unreadable or unparseable lines are skipped,
/// never fatal — journal scans must tolerate torn writes and foreign lines.
///
/// # Errors
///
/// Returns an error only if the file exists but cannot be opened.
pub fn read_json_lines(path: &Path) -> io::Result<Vec<serde_json::Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(&line) {
            records.push(value);
        }
    }
    Ok(records)
}
