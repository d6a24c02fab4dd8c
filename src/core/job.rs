//! Jobs, their completions, and the handles callers wait on
//!
//! A [`Job`] is created by the pool for every `execute()` call. It owns the
//! payload, the enqueue instant, and a [`JobCompletion`] whose `resolve` and
//! `reject` consume it, so exactly one terminal callback fires exactly once.
//! The submitter keeps the matching [`JobHandle`], which can be waited on
//! from a thread or awaited as a future.

use crate::core::cancellation::{CancellationCallbackGuard, CancellationToken};
use crate::core::error::{Result, WorkerPoolError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SlotState<T> {
    outcome: Option<Result<T>>,
    delivered: bool,
    waker: Option<Waker>,
}

/// Rendezvous between a job's completion and its handle
struct CompletionSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> CompletionSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                delivered: false,
                waker: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn deliver(&self, outcome: Result<T>) {
        let waker = {
            let mut state = self.state.lock();
            state.outcome = Some(outcome);
            state.delivered = true;
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The terminal callbacks of a job
///
/// Consumed by [`resolve`](Self::resolve) or [`reject`](Self::reject). A
/// completion dropped without either rejects with
/// [`WorkerPoolError::JobLost`].
pub struct JobCompletion<T> {
    job_id: JobId,
    slot: Option<Arc<CompletionSlot<T>>>,
}

impl<T> JobCompletion<T> {
    /// Deliver the job's result
    pub fn resolve(mut self, value: T) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Ok(value));
        }
    }

    /// Deliver the job's failure
    pub fn reject(mut self, error: WorkerPoolError) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Err(error));
        }
    }

    /// Deliver either outcome
    pub fn settle(self, outcome: Result<T>) {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    /// ID of the job this completion belongs to
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl<T> Drop for JobCompletion<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Err(WorkerPoolError::job_lost(self.job_id)));
        }
    }
}

impl<T> fmt::Debug for JobCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCompletion")
            .field("job_id", &self.job_id)
            .field("pending", &self.slot.is_some())
            .finish()
    }
}

/// A unit of work held by the pool
pub struct Job<I, O> {
    id: JobId,
    data: I,
    completion: JobCompletion<O>,
    enqueued_at: Instant,
    token: CancellationToken,
    cancel_guard: Option<CancellationCallbackGuard>,
}

/// A job taken apart for dispatch
pub(crate) struct DispatchParts<I, O> {
    pub id: JobId,
    pub data: I,
    pub completion: JobCompletion<O>,
    pub enqueued_at: Instant,
    pub token: CancellationToken,
}

impl<I, O> Job<I, O> {
    /// Create a job and the handle its submitter waits on
    pub fn new(data: I, token: CancellationToken) -> (Self, JobHandle<O>) {
        let id = JobId::new();
        let slot = Arc::new(CompletionSlot::new());
        let job = Self {
            id,
            data,
            completion: JobCompletion {
                job_id: id,
                slot: Some(Arc::clone(&slot)),
            },
            enqueued_at: Instant::now(),
            token: token.clone(),
            cancel_guard: None,
        };
        let handle = JobHandle {
            id,
            slot,
            token,
            taken: false,
        };
        (job, handle)
    }

    /// Job ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Payload
    pub fn data(&self) -> &I {
        &self.data
    }

    /// Instant the job was created
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time elapsed since the job was created
    pub fn queue_wait(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Cancellation token carried by the job
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Invoke the success callback
    pub fn resolve(self, value: O) {
        self.completion.resolve(value);
    }

    /// Invoke the failure callback
    pub fn reject(self, error: WorkerPoolError) {
        self.completion.reject(error);
    }

    pub(crate) fn attach_cancel_guard(&mut self, guard: CancellationCallbackGuard) {
        self.cancel_guard = Some(guard);
    }

    /// Error to reject with if the job's token has been cancelled
    pub(crate) fn cancellation_error(&self) -> Option<WorkerPoolError> {
        if self.token.is_cancelled() {
            let reason = self
                .token
                .reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Some(WorkerPoolError::cancelled(self.id, reason))
        } else {
            None
        }
    }

    pub(crate) fn into_dispatch(self) -> DispatchParts<I, O> {
        DispatchParts {
            id: self.id,
            data: self.data,
            completion: self.completion,
            enqueued_at: self.enqueued_at,
            token: self.token,
        }
    }

    /// Reassemble a job whose dispatch did not go through
    ///
    /// The cancellation guard was dropped at dispatch; cancellation is still
    /// observed when the job is next routed or dequeued.
    pub(crate) fn from_dispatch(parts: DispatchParts<I, O>) -> Self {
        Self {
            id: parts.id,
            data: parts.data,
            completion: parts.completion,
            enqueued_at: parts.enqueued_at,
            token: parts.token,
            cancel_guard: None,
        }
    }
}

impl<I, O> fmt::Debug for Job<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("enqueued_at", &self.enqueued_at)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Caller-side handle to a submitted job
///
/// Resolves once the pool invokes the job's completion. Implements
/// [`Future`], so it can be awaited on any executor.
pub struct JobHandle<T> {
    id: JobId,
    slot: Arc<CompletionSlot<T>>,
    token: CancellationToken,
    taken: bool,
}

impl<T> JobHandle<T> {
    /// ID of the job
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Token the job was submitted with
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation
    ///
    /// A queued job is removed and rejected with
    /// [`WorkerPoolError::Cancelled`]; a running job sees the request through
    /// its context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once a result or error has been delivered
    pub fn is_finished(&self) -> bool {
        self.slot.state.lock().delivered
    }

    /// Block until the job completes
    pub fn wait(mut self) -> Result<T> {
        let mut state = self.slot.state.lock();
        while !state.delivered {
            self.slot.ready.wait(&mut state);
        }
        self.taken = true;
        Self::take_outcome(self.id, &mut state.outcome)
    }

    /// Block for at most `timeout`
    ///
    /// Gives the handle back if the job has not completed in time. A
    /// timeout too large for a deadline waits like [`wait`](Self::wait).
    pub fn wait_timeout(mut self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait());
        };
        {
            let mut state = self.slot.state.lock();
            while !state.delivered {
                if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.delivered {
                self.taken = true;
                return Ok(Self::take_outcome(self.id, &mut state.outcome));
            }
        }
        Err(self)
    }

    /// Take the result if the job has already completed
    pub fn try_result(&mut self) -> Option<Result<T>> {
        if self.taken {
            return None;
        }
        let mut state = self.slot.state.lock();
        if state.delivered {
            self.taken = true;
            Some(Self::take_outcome(self.id, &mut state.outcome))
        } else {
            None
        }
    }

    /// Await the result for at most `timeout`
    ///
    /// Unlike [`wait_timeout`](Self::wait_timeout) the handle is consumed;
    /// an expired wait yields [`WorkerPoolError::WaitTimeout`]. The job
    /// itself keeps running.
    #[cfg(feature = "async")]
    pub async fn timeout(self, timeout: Duration) -> Result<T> {
        let job_id = self.id;
        match tokio::time::timeout(timeout, self).await {
            Ok(outcome) => outcome,
            Err(_) => Err(WorkerPoolError::wait_timeout(
                job_id,
                timeout.as_millis() as u64,
            )),
        }
    }

    fn take_outcome(id: JobId, outcome: &mut Option<Result<T>>) -> Result<T> {
        outcome.take().unwrap_or_else(|| {
            Err(WorkerPoolError::other(format!(
                "Result of job {} already taken",
                id
            )))
        })
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.slot.state.lock();
        if state.delivered {
            this.taken = true;
            Poll::Ready(Self::take_outcome(this.id, &mut state.outcome))
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
