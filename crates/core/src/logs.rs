use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::lock::{FileLock, DEFAULT_TIMEOUT};

pub const LEVELS: [&str; 5] = ["debug", "info", "warn", "error", "fatal"];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogRecord {
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub timestamp: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Append-only sequential log with per-session monotonic sequence numbers.
/// Sequence numbers start at 0, are strictly increasing, and dense.
pub struct LogStore {
    path: PathBuf,
    lock: FileLock,
}

impl LogStore {
    pub fn new(path: PathBuf, lock_path: PathBuf) -> Self {
        Self { path, lock: FileLock::new(lock_path) }
    }

    pub fn log(&self, message: &str, level: &str, metadata: Option<Value>, ts: Option<String>) -> Result<LogRecord> {
        if !LEVELS.contains(&level) {
            return Err(Error::InvalidLevel(level.to_string()));
        }

        let _guard = self.lock.acquire(DEFAULT_TIMEOUT)?;
        let next_seq = self.count_lines()?;

        let record = LogRecord {
            sequence_number: next_seq,
            timestamp: ts.unwrap_or_else(|| Utc::now().to_rfc3339()),
            level: level.to_string(),
            message: message.to_string(),
            metadata,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::storage_io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::storage_io(&self.path, e))?;

        let mut line = serde_json::to_vec(&record).map_err(|e| Error::serialization("log record", &self.path, e))?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| Error::storage_io(&self.path, e))?;
        file.sync_data().map_err(|e| Error::storage_io(&self.path, e))?;

        Ok(record)
    }

    fn count_lines(&self) -> Result<u64> {
        match std::fs::File::open(&self.path) {
            Ok(f) => {
                let reader = BufReader::new(f);
                Ok(reader.lines().count() as u64)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::storage_io(&self.path, e)),
        }
    }

    /// Read every persisted record, in sequence order.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        match std::fs::File::open(&self.path) {
            Ok(f) => {
                let reader = BufReader::new(f);
                reader
                    .lines()
                    .map(|line| {
                        let line = line.map_err(|e| Error::storage_io(&self.path, e))?;
                        serde_json::from_str(&line).map_err(|e| Error::serialization("log record", &self.path, e))
                    })
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::storage_io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().join("logs.jsonl"), dir.path().join("logs.lock"));
        (dir, store)
    }

    #[test]
    fn sequence_numbers_start_at_zero_and_are_dense() {
        let (_dir, store) = store();
        let a = store.log("first", "info", None, None).unwrap();
        let b = store.log("second", "warn", None, None).unwrap();
        assert_eq!(a.sequence_number, 0);
        assert_eq!(b.sequence_number, 1);
    }

    #[test]
    fn invalid_level_is_rejected() {
        let (_dir, store) = store();
        let err = store.log("x", "verbose", None, None);
        assert!(matches!(err, Err(Error::InvalidLevel(_))));
    }

    #[test]
    fn lines_are_never_rewritten() {
        let (_dir, store) = store();
        store.log("a", "info", None, None).unwrap();
        store.log("b", "info", None, None).unwrap();
        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "a");
        assert_eq!(records[1].message, "b");
    }

    #[test]
    fn concurrent_logs_produce_dense_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(LogStore::new(dir.path().join("logs.jsonl"), dir.path().join("logs.lock")));

        std::thread::scope(|s| {
            for _ in 0..6 {
                let store = store.clone();
                s.spawn(move || {
                    for _ in 0..4 {
                        store.log("m", "info", None, None).unwrap();
                    }
                });
            }
        });

        let records = store.read_all().unwrap();
        let mut seqs: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..24).collect::<Vec<_>>());
    }
}
