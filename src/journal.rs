//! Append-only JSON-lines journal shared by the four durable logs.
//!
//! Each durable log (policy, provenance, audit, episodic) owns at most one
//! journal and performs every append while holding its own append lock, so
//! the journal itself stays a plain single-writer sink: one serialized line
//! per record, flushed before the append is acknowledged. A record is never
//! rewritten; recovery is a full forward read.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised by journal appends and reads.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Underlying filesystem failure.
    #[error("journal I/O error on '{path}': {source}")]
    Io {
        /// Journal file involved
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// A record could not be serialized for the journal line.
    #[error("journal serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Single-writer JSON-lines sink for one durable log.
#[derive(Debug)]
pub(crate) struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    /// Opens (creating if needed) the journal file `<dir>/<name>.jsonl`.
    pub(crate) fn open(dir: &Path, name: &str) -> Result<Self, JournalError> {
        fs::create_dir_all(dir).map_err(|source| JournalError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = dir.join(format!("{name}.jsonl"));
        // Touch the file so the log is independently readable from creation.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { path })
    }

    /// Appends one record as a JSON line and flushes it.
    ///
    /// Callers serialize appends through their own lock; the journal only
    /// guarantees that an acknowledged line is whole and durable in order.
    pub(crate) fn append<T: Serialize>(&self, record: &T) -> Result<(), JournalError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| JournalError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| JournalError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        file.flush().map_err(|source| JournalError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Path of the underlying journal file.
    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads every record of a JSON-lines journal in append order.
///
/// Lines that fail to parse are skipped rather than aborting the read; a
/// torn trailing line from a crash must not make the whole log unreadable.
pub(crate) fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, JournalError> {
    let file = File::open(path).map_err(|source| JournalError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|source| JournalError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Skipping unparseable journal line");
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        n: u32,
        label: String,
    }

    #[test]
    fn append_then_read_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::open(dir.path(), "audit").unwrap();

        for n in 0..3 {
            journal
                .append(&Row {
                    n,
                    label: format!("row-{n}"),
                })
                .unwrap();
        }

        let rows: Vec<Row> = read_all(journal.path()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].n, 0);
        assert_eq!(rows[2].label, "row-2");
    }

    #[test]
    fn torn_trailing_line_does_not_poison_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JsonlJournal::open(dir.path(), "episodic").unwrap();
        journal.append(&Row { n: 1, label: "ok".into() }).unwrap();

        // Simulate a crash mid-write.
        let mut file = OpenOptions::new()
            .append(true)
            .open(journal.path())
            .unwrap();
        write!(file, "{{\"n\": 2, \"lab").unwrap();
        drop(file);

        let rows: Vec<Row> = read_all(journal.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].n, 1);
    }
}
