//! Convenient re-exports for common types and traits

pub use crate::core::{
    CancellationReason, CancellationToken, FnRoutine, JobContext, JobHandle, JobId, Result,
    RoutineError, WorkerExecutionError, WorkerPoolError, WorkerRoutine, WorkerSpawnError,
};
pub use crate::event_log::{EventLog, EventLogLoader, EventLogRequest};
pub use crate::io::{WorkerFileIoCollector, WorkerFileIoStats};
pub use crate::pool::{PoolMetrics, PoolSettings, WorkerId, WorkerPool, WorkerPoolOptions};
