//! The routine each worker runs

use crate::core::cancellation::CancellationToken;
use crate::core::error::{RoutineError, WorkerPoolError};
use crate::core::job::JobId;
use crate::io::WorkerFileIoCollector;
use crate::pool::worker::WorkerId;
use std::fmt;
use std::marker::PhantomData;

/// Work executed inside a worker, one job at a time
///
/// Every worker owns its own routine instance, created by the pool's
/// factory when the worker is spawned, so `run` takes `&mut self` and can
/// keep per-worker caches.
pub trait WorkerRoutine: Send + 'static {
    /// Payload submitted through `execute`
    type Input: Send + 'static;
    /// Value the job resolves with
    type Output: Send + 'static;

    /// Run one job
    ///
    /// # Errors
    ///
    /// Any error rejects only this job; the worker stays alive.
    fn run(
        &mut self,
        input: Self::Input,
        ctx: &JobContext<'_>,
    ) -> Result<Self::Output, RoutineError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "WorkerRoutine"
    }
}

/// Per-job capabilities handed to a routine
pub struct JobContext<'a> {
    job_id: JobId,
    worker_id: WorkerId,
    io: &'a WorkerFileIoCollector,
    token: &'a CancellationToken,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        job_id: JobId,
        worker_id: WorkerId,
        io: &'a WorkerFileIoCollector,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            io,
            token,
        }
    }

    /// Job being executed
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Worker executing it
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Instrumented file system access for this job
    pub fn io(&self) -> &'a WorkerFileIoCollector {
        self.io
    }

    /// The job's cancellation token
    pub fn token(&self) -> &'a CancellationToken {
        self.token
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns a cancellation error if the job was cancelled
    ///
    /// The pool rejects the job with [`WorkerPoolError::Cancelled`] rather
    /// than an execution error when a routine bails out with it.
    pub fn check_cancelled(&self) -> Result<(), RoutineError> {
        if self.token.is_cancelled() {
            let reason = self
                .token
                .reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Err(Box::new(WorkerPoolError::cancelled(self.job_id, reason)))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("worker_id", &self.worker_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A routine built from a closure
pub struct FnRoutine<F, I, O> {
    f: F,
    name: String,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnRoutine<F, I, O>
where
    F: FnMut(I, &JobContext<'_>) -> Result<O, RoutineError> + Send + 'static,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self::with_name(f, "FnRoutine")
    }

    /// Wrap a closure with a custom name
    pub fn with_name<S: Into<String>>(f: F, name: S) -> Self {
        Self {
            f,
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<F: Clone, I, O> Clone for FnRoutine<F, I, O> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, I, O> WorkerRoutine for FnRoutine<F, I, O>
where
    F: FnMut(I, &JobContext<'_>) -> Result<O, RoutineError> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn run(&mut self, input: I, ctx: &JobContext<'_>) -> Result<O, RoutineError> {
        (self.f)(input, ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
