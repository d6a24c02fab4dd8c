//! File I/O instrumentation for worker routines

mod collector;
#[cfg(feature = "metrics")]
mod summary;

pub use collector::{
    FileIoOperationType, WorkerFileIoCollector, WorkerFileIoOperation, WorkerFileIoStats,
};
#[cfg(feature = "metrics")]
pub use summary::{FileIoAggregator, FileIoSummary, FileIoTotals};
