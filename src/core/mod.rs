//! Core types and traits for the worker pool

pub mod cancellation;
pub mod error;
pub mod job;
pub mod routine;

pub use cancellation::{CancellationCallbackGuard, CancellationReason, CancellationToken};
pub use error::{
    ExecutionFailureKind, Result, RoutineError, SharedError, WorkerExecutionError,
    WorkerPoolError, WorkerSpawnError,
};
pub use job::{Job, JobCompletion, JobHandle, JobId};
pub use routine::{FnRoutine, JobContext, WorkerRoutine};
