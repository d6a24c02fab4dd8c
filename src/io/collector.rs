//! Per-worker file I/O instrumentation
//!
//! Routines do their file system access through the
//! [`WorkerFileIoCollector`] exposed by their job context. Every call is
//! forwarded to `std::fs` unchanged and its timing, size and error flag are
//! appended to the collector. The worker clears the collector right before
//! a job and takes its contents right after, so one job's stats never
//! contain another job's operations.

use crate::pool::worker::WorkerId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

/// Kind of file system call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileIoOperationType {
    /// Whole-file read
    Read,
    /// Whole-file write
    Write,
    /// Metadata or existence check
    Stat,
    /// Directory listing
    ReadDir,
}

impl std::fmt::Display for FileIoOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileIoOperationType::Read => "read",
            FileIoOperationType::Write => "write",
            FileIoOperationType::Stat => "stat",
            FileIoOperationType::ReadDir => "read_dir",
        };
        f.write_str(name)
    }
}

pub(crate) fn serialize_duration_ms<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// One recorded file system call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerFileIoOperation {
    /// Kind of call
    #[serde(rename = "type")]
    pub op_type: FileIoOperationType,
    /// Path the call was made on
    pub path: String,
    /// Wall time spent in the call
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    /// Bytes read or written, when known
    pub size: Option<u64>,
    /// Whether the call returned an error
    pub error: bool,
    /// When the call started
    pub timestamp: DateTime<Utc>,
}

/// File I/O performed by one job on one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerFileIoStats {
    /// Worker that ran the job
    pub worker_id: WorkerId,
    /// Operations in the order they happened
    pub operations: Vec<WorkerFileIoOperation>,
}

impl WorkerFileIoStats {
    /// True when the job did no file I/O
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of recorded operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Sum of all operation durations
    pub fn total_duration(&self) -> Duration {
        self.operations.iter().map(|op| op.duration).sum()
    }

    /// Sum of all known sizes
    pub fn total_bytes(&self) -> u64 {
        self.operations.iter().filter_map(|op| op.size).sum()
    }

    /// Number of operations that failed
    pub fn error_count(&self) -> usize {
        self.operations.iter().filter(|op| op.error).count()
    }

    /// JSON form for telemetry sinks
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Records the file system calls a worker makes while running a job
#[derive(Debug)]
pub struct WorkerFileIoCollector {
    worker_id: WorkerId,
    operations: Mutex<Vec<WorkerFileIoOperation>>,
}

impl WorkerFileIoCollector {
    /// Create an empty collector for a worker
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Worker this collector belongs to
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Forget everything recorded so far
    pub fn clear_stats(&self) {
        self.operations.lock().clear();
    }

    /// Copy of the operations recorded so far
    pub fn stats(&self) -> WorkerFileIoStats {
        WorkerFileIoStats {
            worker_id: self.worker_id,
            operations: self.operations.lock().clone(),
        }
    }

    /// Move the recorded operations out, leaving the collector empty
    pub fn take_stats(&self) -> WorkerFileIoStats {
        WorkerFileIoStats {
            worker_id: self.worker_id,
            operations: std::mem::take(&mut *self.operations.lock()),
        }
    }

    /// Time `call` and record it
    ///
    /// The call's result is returned untouched; `size` only reads it.
    pub fn record<T, P, F, S>(
        &self,
        op_type: FileIoOperationType,
        path: P,
        call: F,
        size: S,
    ) -> io::Result<T>
    where
        P: AsRef<Path>,
        F: FnOnce(&Path) -> io::Result<T>,
        S: FnOnce(&T) -> Option<u64>,
    {
        let path = path.as_ref();
        let timestamp = Utc::now();
        let start = Instant::now();
        let result = call(path);
        let duration = start.elapsed();

        let (size, error) = match &result {
            Ok(value) => (size(value), false),
            Err(_) => (None, true),
        };

        self.operations.lock().push(WorkerFileIoOperation {
            op_type,
            path: path.display().to_string(),
            duration,
            size,
            error,
            timestamp,
        });

        result
    }

    /// Instrumented [`std::fs::read`]
    pub fn read<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<u8>> {
        self.record(FileIoOperationType::Read, path, |p| fs::read(p), |bytes| {
            Some(bytes.len() as u64)
        })
    }

    /// Instrumented [`std::fs::read_to_string`]
    pub fn read_to_string<P: AsRef<Path>>(&self, path: P) -> io::Result<String> {
        self.record(FileIoOperationType::Read, path, |p| fs::read_to_string(p), |text| {
            Some(text.len() as u64)
        })
    }

    /// Instrumented [`std::fs::write`]
    pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(&self, path: P, contents: C) -> io::Result<()> {
        let contents = contents.as_ref();
        let len = contents.len() as u64;
        self.record(
            FileIoOperationType::Write,
            path,
            |p| fs::write(p, contents),
            |_| Some(len),
        )
    }

    /// Instrumented [`std::fs::metadata`]
    pub fn metadata<P: AsRef<Path>>(&self, path: P) -> io::Result<fs::Metadata> {
        self.record(FileIoOperationType::Stat, path, |p| fs::metadata(p), |meta| {
            Some(meta.len())
        })
    }

    /// Instrumented [`Path::try_exists`]
    pub fn exists<P: AsRef<Path>>(&self, path: P) -> io::Result<bool> {
        self.record(FileIoOperationType::Stat, path, |p| p.try_exists(), |_| None)
    }

    /// Instrumented [`std::fs::read_dir`], collected eagerly
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<fs::DirEntry>> {
        self.record(
            FileIoOperationType::ReadDir,
            path,
            |p| fs::read_dir(p)?.collect::<io::Result<Vec<_>>>(),
            |_| None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_is_transparent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        fs::write(&path, b"{\"type\":\"step\"}\n").unwrap();

        let io = WorkerFileIoCollector::new(WorkerId::new(0));
        let monitored = io.read(&path).unwrap();
        assert_eq!(monitored, fs::read(&path).unwrap());

        let stats = io.stats();
        assert_eq!(stats.len(), 1);
        let op = &stats.operations[0];
        assert_eq!(op.op_type, FileIoOperationType::Read);
        assert_eq!(op.size, Some(monitored.len() as u64));
        assert!(!op.error);
        assert!(op.path.ends_with("session.jsonl"));
    }

    #[test]
    fn test_errors_are_passed_through_and_flagged() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.jsonl");

        let io = WorkerFileIoCollector::new(WorkerId::new(0));
        let monitored = io.read_to_string(&missing).unwrap_err();
        let direct = fs::read_to_string(&missing).unwrap_err();
        assert_eq!(monitored.kind(), direct.kind());

        let stats = io.take_stats();
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.operations[0].size, None);
        assert!(io.stats().is_empty());
    }

    #[test]
    fn test_operations_keep_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("task.json");

        let io = WorkerFileIoCollector::new(WorkerId::new(2));
        io.write(&path, "{}").unwrap();
        assert!(io.exists(&path).unwrap());
        io.metadata(&path).unwrap();
        assert_eq!(io.read_dir(dir.path()).unwrap().len(), 1);

        let kinds: Vec<_> = io.stats().operations.iter().map(|op| op.op_type).collect();
        assert_eq!(
            kinds,
            vec![
                FileIoOperationType::Write,
                FileIoOperationType::Stat,
                FileIoOperationType::Stat,
                FileIoOperationType::ReadDir,
            ]
        );
        assert_eq!(io.stats().total_bytes(), 2 + 2);
    }

    #[test]
    fn test_clear_stats_isolates_jobs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        fs::write(&path, "[]").unwrap();

        let io = WorkerFileIoCollector::new(WorkerId::new(0));
        io.read(&path).unwrap();
        io.clear_stats();
        assert!(io.take_stats().is_empty());
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issue.json");
        fs::write(&path, "{}").unwrap();

        let io = WorkerFileIoCollector::new(WorkerId::new(4));
        io.read(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&io.stats().to_json().unwrap()).unwrap();
        assert_eq!(json["worker_id"], 4);
        assert_eq!(json["operations"][0]["type"], "read");
        assert_eq!(json["operations"][0]["size"], 2);
        assert!(json["operations"][0]["duration_ms"].is_f64());
    }
}
