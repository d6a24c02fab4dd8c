//! Pool-wide aggregation of per-job file I/O stats

use crate::io::collector::{serialize_duration_ms, FileIoOperationType, WorkerFileIoStats};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running totals for one kind of file system call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FileIoTotals {
    /// Number of calls
    pub operations: u64,
    /// Calls that returned an error
    pub errors: u64,
    /// Time spent in the calls
    #[serde(rename = "total_duration_ms", serialize_with = "serialize_duration_ms")]
    pub total_duration: Duration,
    /// Bytes read or written
    pub total_bytes: u64,
}

/// Snapshot of everything the pool's workers reported
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileIoSummary {
    /// Jobs that reported at least one operation
    pub jobs_reported: u64,
    /// Totals per kind of call
    pub by_type: BTreeMap<FileIoOperationType, FileIoTotals>,
}

impl FileIoSummary {
    /// Calls across every kind
    pub fn total_operations(&self) -> u64 {
        self.by_type.values().map(|t| t.operations).sum()
    }
}

/// Aggregates stats reported by every worker in a pool
#[derive(Debug, Default)]
pub struct FileIoAggregator {
    totals: DashMap<FileIoOperationType, FileIoTotals>,
    jobs_reported: AtomicU64,
}

impl FileIoAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one job's stats into the totals
    pub fn record(&self, stats: &WorkerFileIoStats) {
        if stats.is_empty() {
            return;
        }
        self.jobs_reported.fetch_add(1, Ordering::Relaxed);
        for op in &stats.operations {
            let mut entry = self.totals.entry(op.op_type).or_default();
            entry.operations += 1;
            entry.total_duration += op.duration;
            entry.total_bytes += op.size.unwrap_or(0);
            if op.error {
                entry.errors += 1;
            }
        }
    }

    /// Current totals
    pub fn summary(&self) -> FileIoSummary {
        FileIoSummary {
            jobs_reported: self.jobs_reported.load(Ordering::Relaxed),
            by_type: self
                .totals
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
        }
    }

    /// Forget everything
    pub fn reset(&self) {
        self.totals.clear();
        self.jobs_reported.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::collector::WorkerFileIoOperation;
    use crate::pool::worker::WorkerId;
    use chrono::Utc;

    fn op(op_type: FileIoOperationType, size: Option<u64>, error: bool) -> WorkerFileIoOperation {
        WorkerFileIoOperation {
            op_type,
            path: "/logs/session-1/events.jsonl".to_string(),
            duration: Duration::from_millis(2),
            size,
            error,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_aggregates_by_type() {
        let aggregator = FileIoAggregator::new();
        aggregator.record(&WorkerFileIoStats {
            worker_id: WorkerId::new(0),
            operations: vec![
                op(FileIoOperationType::Stat, Some(10), false),
                op(FileIoOperationType::Read, Some(10), false),
            ],
        });
        aggregator.record(&WorkerFileIoStats {
            worker_id: WorkerId::new(1),
            operations: vec![op(FileIoOperationType::Read, None, true)],
        });

        let summary = aggregator.summary();
        assert_eq!(summary.jobs_reported, 2);
        assert_eq!(summary.total_operations(), 3);

        let reads = summary.by_type[&FileIoOperationType::Read];
        assert_eq!(reads.operations, 2);
        assert_eq!(reads.errors, 1);
        assert_eq!(reads.total_bytes, 10);
        assert_eq!(reads.total_duration, Duration::from_millis(4));
    }

    #[test]
    fn test_empty_stats_are_ignored() {
        let aggregator = FileIoAggregator::new();
        aggregator.record(&WorkerFileIoStats {
            worker_id: WorkerId::new(0),
            operations: Vec::new(),
        });
        assert_eq!(aggregator.summary(), FileIoSummary::default());
    }

    #[test]
    fn test_reset() {
        let aggregator = FileIoAggregator::new();
        aggregator.record(&WorkerFileIoStats {
            worker_id: WorkerId::new(0),
            operations: vec![op(FileIoOperationType::Write, Some(5), false)],
        });
        aggregator.reset();
        assert_eq!(aggregator.summary().total_operations(), 0);
    }
}
