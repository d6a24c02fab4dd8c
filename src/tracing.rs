//! Tracing integration for observability.
//!
//! With the `tracing` feature enabled the pool emits structured events
//! (see [`events`]) next to its `log` lines, and [`TracedRoutine`] carries
//! the span that was current when the pool was built into every job.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_log_workers::prelude::*;
//! use agent_log_workers::tracing::TracedRoutine;
//!
//! let span = tracing::info_span!("dashboard", view = "sessions");
//! let pool = WorkerPool::new(WorkerPoolOptions::default(), move |_| {
//!     Ok(TracedRoutine::with_span(EventLogLoader::new(), span.clone()))
//! })?;
//! ```

use crate::core::{JobContext, RoutineError, WorkerRoutine};

/// A routine wrapper that runs every job inside a captured span.
///
/// Without the `tracing` feature it simply forwards to the inner routine.
pub struct TracedRoutine<R: WorkerRoutine> {
    inner: R,
    #[cfg(feature = "tracing")]
    span: tracing::Span,
}

impl<R: WorkerRoutine> TracedRoutine<R> {
    /// Wrap a routine, capturing the current span.
    pub fn new(routine: R) -> Self {
        Self {
            inner: routine,
            #[cfg(feature = "tracing")]
            span: tracing::Span::current(),
        }
    }

    /// Wrap a routine with a specific span.
    #[cfg(feature = "tracing")]
    pub fn with_span(routine: R, span: tracing::Span) -> Self {
        Self {
            inner: routine,
            span,
        }
    }

    /// The wrapped routine.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: WorkerRoutine + Clone> Clone for TracedRoutine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            #[cfg(feature = "tracing")]
            span: self.span.clone(),
        }
    }
}

impl<R: WorkerRoutine> WorkerRoutine for TracedRoutine<R> {
    type Input = R::Input;
    type Output = R::Output;

    fn run(&mut self, input: R::Input, ctx: &JobContext<'_>) -> Result<R::Output, RoutineError> {
        #[cfg(feature = "tracing")]
        let _guard = self.span.enter();
        self.inner.run(input, ctx)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Structured pool events.
///
/// These can be consumed by metrics collection systems via a tracing
/// subscriber layer.
#[cfg(feature = "tracing")]
pub mod events {
    use crate::core::JobId;
    use crate::pool::WorkerId;
    use std::time::Duration;

    /// Records a job handed to a worker.
    #[inline]
    pub fn record_dispatch(job_id: JobId, worker_id: WorkerId, queue_wait: Duration) {
        tracing::trace!(
            counter.jobs_dispatched = 1,
            histogram.queue_wait_ms = queue_wait.as_millis() as u64,
            job_id = %job_id,
            worker_id = worker_id.as_u64(),
            "job dispatched"
        );
    }

    /// Records job completion with timing.
    #[inline]
    pub fn record_completion(job_id: JobId, worker_id: WorkerId, duration: Duration, success: bool) {
        let duration_ms = duration.as_millis() as u64;
        if success {
            tracing::trace!(
                counter.jobs_succeeded = 1,
                histogram.job_duration_ms = duration_ms,
                job_id = %job_id,
                worker_id = worker_id.as_u64(),
                "job completed successfully"
            );
        } else {
            tracing::trace!(
                counter.jobs_failed = 1,
                histogram.job_duration_ms = duration_ms,
                job_id = %job_id,
                worker_id = worker_id.as_u64(),
                "job failed"
            );
        }
    }

    /// Records a worker joining the pool.
    #[inline]
    pub fn record_worker_spawned(pool: &str, worker_id: WorkerId, slot: usize, live: usize) {
        tracing::debug!(
            gauge.workers_live = live as i64,
            pool = pool,
            worker_id = worker_id.as_u64(),
            slot = slot,
            "worker spawned"
        );
    }

    /// Records an idle worker being retired.
    #[inline]
    pub fn record_worker_retired(pool: &str, worker_id: WorkerId, slot: usize, live: usize) {
        tracing::debug!(
            gauge.workers_live = live as i64,
            pool = pool,
            worker_id = worker_id.as_u64(),
            slot = slot,
            "worker retired"
        );
    }

    /// Records pool shutdown.
    #[inline]
    pub fn record_pool_shutdown(pool: &str, workers: usize, rejected_jobs: usize) {
        tracing::info!(
            pool = pool,
            workers = workers,
            rejected_jobs = rejected_jobs,
            "worker pool shutting down"
        );
    }
}
