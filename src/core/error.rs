//! Error types for the worker pool

use crate::core::job::JobId;
use crate::pool::worker::WorkerId;
use std::sync::Arc;

/// Result type for worker pool operations
pub type Result<T> = std::result::Result<T, WorkerPoolError>;

/// Error returned by a [`WorkerRoutine`](crate::core::WorkerRoutine)
pub type RoutineError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error source that can be handed to several observers
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// A worker could not be created
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to spawn worker in slot #{slot} of pool '{pool}': {message}")]
pub struct WorkerSpawnError {
    /// Name of the pool
    pub pool: String,
    /// Arena slot the worker was meant to occupy
    pub slot: usize,
    /// Error message
    pub message: String,
    /// Underlying cause (thread creation or routine initialisation)
    #[source]
    pub source: Option<SharedError>,
}

impl WorkerSpawnError {
    /// Create a spawn error without a source
    pub fn new(pool: impl Into<String>, slot: usize, message: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            slot,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause
    #[must_use]
    pub fn with_source(mut self, source: SharedError) -> Self {
        self.source = Some(source);
        self
    }
}

/// How a job failed inside its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailureKind {
    /// The routine returned an error
    Failed,
    /// The routine panicked
    Panicked,
}

impl std::fmt::Display for ExecutionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionFailureKind::Failed => write!(f, "failed"),
            ExecutionFailureKind::Panicked => write!(f, "panicked"),
        }
    }
}

/// The routine running inside a worker failed for one job
#[derive(Debug, Clone, thiserror::Error)]
#[error("Job {job_id} {kind} on {worker_id}: {message}")]
pub struct WorkerExecutionError {
    /// ID of the failed job
    pub job_id: JobId,
    /// Worker that ran the job
    pub worker_id: WorkerId,
    /// Whether the routine errored or panicked
    pub kind: ExecutionFailureKind,
    /// Error message
    pub message: String,
    /// Error returned by the routine, if any
    #[source]
    pub source: Option<SharedError>,
}

impl WorkerExecutionError {
    /// Create an execution error from a routine error
    pub fn failed(job_id: JobId, worker_id: WorkerId, error: RoutineError) -> Self {
        Self {
            job_id,
            worker_id,
            kind: ExecutionFailureKind::Failed,
            message: error.to_string(),
            source: Some(Arc::from(error)),
        }
    }

    /// Create an execution error from a caught panic
    pub fn panicked(job_id: JobId, worker_id: WorkerId, message: impl Into<String>) -> Self {
        Self {
            job_id,
            worker_id,
            kind: ExecutionFailureKind::Panicked,
            message: message.into(),
            source: None,
        }
    }
}

/// Errors that can occur in the worker pool
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum WorkerPoolError {
    /// A worker could not be started
    #[error(transparent)]
    Spawn(#[from] WorkerSpawnError),

    /// A job failed inside its worker
    #[error(transparent)]
    Execution(#[from] WorkerExecutionError),

    /// Pool is shutting down with job count
    #[error("Worker pool '{pool}' is shutting down ({pending_jobs} queued jobs rejected)")]
    ShuttingDown {
        /// Name of the pool
        pool: String,
        /// Number of jobs still queued when shutdown started
        pending_jobs: usize,
    },

    /// Job was cancelled with reason
    #[error("Job cancelled (job_id: {job_id}): {reason}")]
    Cancelled {
        /// ID of the cancelled job
        job_id: JobId,
        /// Reason for cancellation
        reason: String,
    },

    /// Invalid configuration with parameter
    #[error("Invalid configuration for '{parameter}': {message}")]
    InvalidConfig {
        /// Configuration parameter name
        parameter: String,
        /// Error message
        message: String,
    },

    /// The job's completion was dropped before a result was delivered
    #[error("Job {job_id} was dropped without completing")]
    JobLost {
        /// ID of the lost job
        job_id: JobId,
    },

    /// Waiting for a job result timed out
    #[error("Timed out after {timeout_ms}ms waiting for job {job_id}")]
    WaitTimeout {
        /// ID of the job being waited on
        job_id: JobId,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// General pool-level error with optional cause
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Underlying cause
        #[source]
        source: Option<SharedError>,
    },
}

impl WorkerPoolError {
    /// Create a shutting down error
    pub fn shutting_down(pool: impl Into<String>, pending_jobs: usize) -> Self {
        WorkerPoolError::ShuttingDown {
            pool: pool.into(),
            pending_jobs,
        }
    }

    /// Create a cancelled error
    pub fn cancelled(job_id: JobId, reason: impl Into<String>) -> Self {
        WorkerPoolError::Cancelled {
            job_id,
            reason: reason.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        WorkerPoolError::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a lost job error
    pub fn job_lost(job_id: JobId) -> Self {
        WorkerPoolError::JobLost { job_id }
    }

    /// Create a wait timeout error
    pub fn wait_timeout(job_id: JobId, timeout_ms: u64) -> Self {
        WorkerPoolError::WaitTimeout { job_id, timeout_ms }
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        WorkerPoolError::Other {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a generic error carrying its cause
    pub fn other_with_source<S: Into<String>>(msg: S, source: SharedError) -> Self {
        WorkerPoolError::Other {
            message: msg.into(),
            source: Some(source),
        }
    }

    /// True for [`WorkerPoolError::Spawn`]
    pub fn is_spawn(&self) -> bool {
        matches!(self, WorkerPoolError::Spawn(_))
    }

    /// True for [`WorkerPoolError::Execution`]
    pub fn is_execution(&self) -> bool {
        matches!(self, WorkerPoolError::Execution(_))
    }

    /// True for [`WorkerPoolError::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerPoolError::Cancelled { .. })
    }
}
