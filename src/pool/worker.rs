//! Worker threads and the pool's bookkeeping for them

use crate::core::{
    CancellationToken, JobCompletion, JobContext, JobId, Result, WorkerExecutionError,
    WorkerPoolError, WorkerRoutine,
};
use crate::core::job::DispatchParts;
use crate::io::{WorkerFileIoCollector, WorkerFileIoStats};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier of a worker, unique for the lifetime of its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wrap a raw ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A job handed to a worker thread
pub(crate) struct Assignment<I> {
    pub job_id: JobId,
    pub data: I,
    pub token: CancellationToken,
}

/// What a worker thread reports after running a job
pub(crate) struct CompletionReport<O> {
    pub job_id: JobId,
    pub outcome: Result<O>,
    pub execution_time: Duration,
    pub file_io: WorkerFileIoStats,
}

/// What a worker thread does next while it has no job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleInstruction {
    /// Block until a message arrives
    Wait,
    /// Block at most this long, then ask the pool whether to retire
    WaitFor(Duration),
    /// Leave the loop; the pool has already forgotten this worker
    Exit,
}

/// The pool side a worker thread reports to
pub(crate) trait Supervisor<O>: Send + Sync {
    fn report_completion(
        &self,
        slot: usize,
        worker_id: WorkerId,
        report: CompletionReport<O>,
    ) -> IdleInstruction;

    fn idle_timeout_elapsed(&self, slot: usize, worker_id: WorkerId) -> IdleInstruction;
}

/// Job currently running on a worker
pub(crate) struct InFlight<O> {
    pub job_id: JobId,
    pub completion: JobCompletion<O>,
    pub started_at: Instant,
}

/// Whether a worker is running a job
pub(crate) enum WorkerStatus<O> {
    Idle,
    Busy(InFlight<O>),
}

/// Armed idle timer of a surplus worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleTimer {
    pub deadline: Instant,
}

impl IdleTimer {
    /// `None` if the deadline is past what `Instant` can represent
    fn new(timeout: Duration) -> Option<Self> {
        Instant::now()
            .checked_add(timeout)
            .map(|deadline| Self { deadline })
    }

    /// Time left before expiry, `None` once expired
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(now);
        if left.is_zero() {
            None
        } else {
            Some(left)
        }
    }
}

/// Serializable view of a worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    /// Worker ID
    pub id: WorkerId,
    /// Arena slot the worker occupies
    pub slot: usize,
    /// True while a job is running
    pub busy: bool,
    /// Job currently running, if any
    pub current_job: Option<JobId>,
    /// True if an idle timer is armed
    pub retiring: bool,
    /// Jobs this worker has finished
    pub jobs_completed: u64,
    /// When the worker was spawned
    pub created_at: DateTime<Utc>,
}

/// The pool's record of one live worker
///
/// Closing the mailbox is the terminate signal: the thread finishes the job
/// it is running, if any, and exits.
pub(crate) struct WorkerEntry<I, O> {
    id: WorkerId,
    slot: usize,
    mailbox: Option<Sender<Assignment<I>>>,
    thread: Option<JoinHandle<()>>,
    status: WorkerStatus<O>,
    timer: Option<IdleTimer>,
    created_at: DateTime<Utc>,
    jobs_completed: u64,
}

impl<I, O> WorkerEntry<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Start a worker thread running `routine`
    pub fn spawn<R>(
        slot: usize,
        id: WorkerId,
        thread_name: String,
        routine: R,
        supervisor: Weak<dyn Supervisor<O>>,
    ) -> std::io::Result<Self>
    where
        R: WorkerRoutine<Input = I, Output = O>,
    {
        let (mailbox, inbox) = crossbeam_channel::unbounded();

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(slot, id, routine, inbox, supervisor))?;

        Ok(Self {
            id,
            slot,
            mailbox: Some(mailbox),
            thread: Some(thread),
            status: WorkerStatus::Idle,
            timer: None,
            created_at: Utc::now(),
            jobs_completed: 0,
        })
    }
}

impl<I, O> WorkerEntry<I, O> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle)
    }

    pub fn is_busy(&self) -> bool {
        !self.is_idle()
    }

    pub fn timer(&self) -> Option<IdleTimer> {
        self.timer
    }

    /// Send a job to the worker and mark it busy
    ///
    /// Gives the job back if the worker thread is gone.
    pub fn assign(
        &mut self,
        parts: DispatchParts<I, O>,
    ) -> std::result::Result<(), DispatchParts<I, O>> {
        let DispatchParts {
            id,
            data,
            completion,
            enqueued_at,
            token,
        } = parts;

        let Some(mailbox) = &self.mailbox else {
            return Err(DispatchParts {
                id,
                data,
                completion,
                enqueued_at,
                token,
            });
        };

        match mailbox.send(Assignment {
            job_id: id,
            data,
            token,
        }) {
            Ok(()) => {
                self.status = WorkerStatus::Busy(InFlight {
                    job_id: id,
                    completion,
                    started_at: Instant::now(),
                });
                self.timer = None;
                Ok(())
            }
            Err(err) => {
                let assignment = err.into_inner();
                Err(DispatchParts {
                    id,
                    data: assignment.data,
                    completion,
                    enqueued_at,
                    token: assignment.token,
                })
            }
        }
    }

    /// Mark the worker idle, handing back the job it was running
    pub fn finish(&mut self) -> Option<InFlight<O>> {
        match std::mem::replace(&mut self.status, WorkerStatus::Idle) {
            WorkerStatus::Busy(in_flight) => {
                self.jobs_completed += 1;
                Some(in_flight)
            }
            WorkerStatus::Idle => None,
        }
    }

    /// Returns false, leaving the worker unarmed, for a timeout too far out
    /// to ever expire
    pub fn arm_timer(&mut self, timeout: Duration) -> bool {
        self.timer = IdleTimer::new(timeout);
        self.timer.is_some()
    }

    pub fn clear_timer(&mut self) {
        self.timer = None;
    }

    /// Ask the worker thread to exit once its current job is done
    pub fn terminate(&mut self) {
        self.mailbox = None;
    }

    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }

    pub fn info(&self) -> WorkerInfo {
        let current_job = match &self.status {
            WorkerStatus::Busy(in_flight) => Some(in_flight.job_id),
            WorkerStatus::Idle => None,
        };
        WorkerInfo {
            id: self.id,
            slot: self.slot,
            busy: current_job.is_some(),
            current_job,
            retiring: self.timer.is_some(),
            jobs_completed: self.jobs_completed,
            created_at: self.created_at,
        }
    }
}

impl<I, O> fmt::Debug for WorkerEntry<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEntry")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("busy", &self.is_busy())
            .field("timer", &self.timer)
            .field("jobs_completed", &self.jobs_completed)
            .finish()
    }
}

/// Main worker loop
///
/// The thread never decides on its own to retire: when an idle wait times
/// out it asks the supervisor, which re-checks under the pool lock.
fn run<R: WorkerRoutine>(
    slot: usize,
    id: WorkerId,
    mut routine: R,
    inbox: Receiver<Assignment<R::Input>>,
    supervisor: Weak<dyn Supervisor<R::Output>>,
) {
    #[cfg(feature = "tracing")]
    let worker_span = tracing::span!(tracing::Level::DEBUG, "worker", id = id.as_u64(), slot);
    #[cfg(feature = "tracing")]
    let _guard = worker_span.enter();

    log::debug!("{} started in slot #{} running {}", id, slot, routine.name());

    let io = WorkerFileIoCollector::new(id);
    let mut instruction = IdleInstruction::Wait;

    loop {
        let assignment = match instruction {
            IdleInstruction::Exit => break,
            IdleInstruction::Wait => match inbox.recv() {
                Ok(assignment) => assignment,
                Err(_) => break,
            },
            IdleInstruction::WaitFor(timeout) => match inbox.recv_timeout(timeout) {
                Ok(assignment) => assignment,
                Err(RecvTimeoutError::Timeout) => {
                    instruction = match supervisor.upgrade() {
                        Some(pool) => pool.idle_timeout_elapsed(slot, id),
                        None => IdleInstruction::Exit,
                    };
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        let report = execute(id, &mut routine, assignment, &io);
        instruction = match supervisor.upgrade() {
            Some(pool) => pool.report_completion(slot, id, report),
            None => IdleInstruction::Exit,
        };
    }

    log::debug!("{} exiting", id);
}

/// Run one job with panic protection and file I/O isolation
fn execute<R: WorkerRoutine>(
    id: WorkerId,
    routine: &mut R,
    assignment: Assignment<R::Input>,
    io: &WorkerFileIoCollector,
) -> CompletionReport<R::Output> {
    let Assignment {
        job_id,
        data,
        token,
    } = assignment;

    #[cfg(feature = "tracing")]
    let job_span = tracing::span!(tracing::Level::DEBUG, "job_execution", job_id = %job_id);
    #[cfg(feature = "tracing")]
    let _job_guard = job_span.enter();

    io.clear_stats();
    let start = Instant::now();

    let result = {
        let ctx = JobContext::new(job_id, id, io, &token);
        catch_unwind(AssertUnwindSafe(|| routine.run(data, &ctx)))
    };

    let execution_time = start.elapsed();
    let outcome = match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => match err.downcast::<WorkerPoolError>() {
            // cooperative cancellation and other pool errors pass through
            Ok(pool_err) => Err(*pool_err),
            Err(err) => {
                log::warn!("Job {} failed on {}: {}", job_id, id, err);
                Err(WorkerExecutionError::failed(job_id, id, err).into())
            }
        },
        Err(panic_info) => {
            let panic_msg = panic_message(panic_info.as_ref());
            log::error!("Job {} panicked on {}: {}", job_id, id, panic_msg);
            Err(WorkerExecutionError::panicked(job_id, id, panic_msg).into())
        }
    };

    CompletionReport {
        job_id,
        outcome,
        execution_time,
        file_io: io.take_stats(),
    }
}

fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Join a worker thread, giving up after `timeout`
///
/// A thread still running after the timeout is left detached.
pub(crate) fn join_with_timeout(
    id: WorkerId,
    thread: JoinHandle<()>,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if thread.is_finished() {
            return thread.join().map_err(|panic_info| {
                WorkerPoolError::other(format!(
                    "{} panicked during shutdown: {}",
                    id,
                    panic_message(panic_info.as_ref())
                ))
            });
        }

        if start.elapsed() >= timeout {
            return Err(WorkerPoolError::other(format!(
                "{} did not finish within {}ms; thread may be leaked",
                id,
                timeout.as_millis()
            )));
        }

        thread::sleep(Duration::from_millis(5));
    }
}
