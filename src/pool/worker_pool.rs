//! Elastic worker pool
//!
//! [`WorkerPool`] keeps between `min_concurrency` and `max_concurrency`
//! worker threads, each running its own instance of a [`WorkerRoutine`].
//! Jobs go to the lowest-slot idle worker, to a freshly spawned worker while
//! the ceiling allows, or to a FIFO queue. Workers above `min_concurrency`
//! retire after sitting idle for `idle_timeout`.
//!
//! Every decision is taken under a single pool lock. User callbacks
//! (`error_handler`, file I/O stats sink) run after the lock is released.
//!
//! # Example
//!
//! ```rust
//! use agent_log_workers::prelude::*;
//!
//! let options = WorkerPoolOptions::new(1, 2).with_name("line-counter");
//! let pool = WorkerPool::with_routine(
//!     options,
//!     FnRoutine::new(|text: String, _ctx: &JobContext<'_>| Ok(text.lines().count())),
//! )
//! .unwrap();
//!
//! let handle = pool.execute("{}\n{}\n".to_string());
//! assert_eq!(handle.wait().unwrap(), 2);
//! pool.shutdown().unwrap();
//! ```

use crate::core::{
    CancellationToken, Job, JobHandle, JobId, Result, RoutineError, WorkerPoolError,
    WorkerRoutine, WorkerSpawnError,
};
#[cfg(feature = "metrics")]
use crate::io::{FileIoAggregator, FileIoSummary};
use crate::io::WorkerFileIoStats;
use crate::pool::config::WorkerPoolOptions;
use crate::pool::metrics::{MetricsCollector, PoolMetrics};
use crate::pool::scheduler::JobScheduler;
use crate::pool::worker::{
    join_with_timeout, CompletionReport, IdleInstruction, Supervisor, WorkerEntry, WorkerId,
    WorkerInfo,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

type RoutineFactory<R> = dyn Fn(WorkerId) -> std::result::Result<R, RoutineError> + Send + Sync;

/// Everything the pool decides on, guarded by one lock
struct PoolState<I, O> {
    scheduler: JobScheduler<I, O>,
    /// Arena of length `max_concurrency`; `None` marks a free slot
    slots: Vec<Option<WorkerEntry<I, O>>>,
    metrics: MetricsCollector,
    next_worker_id: u64,
    shutting_down: bool,
}

impl<I, O> PoolState<I, O> {
    fn new(max_concurrency: usize) -> Self {
        Self {
            scheduler: JobScheduler::new(),
            slots: (0..max_concurrency).map(|_| None).collect(),
            metrics: MetricsCollector::new(),
            next_worker_id: 0,
            shutting_down: false,
        }
    }

    fn workers(&self) -> impl Iterator<Item = &WorkerEntry<I, O>> {
        self.slots.iter().flatten()
    }

    fn live_count(&self) -> usize {
        self.workers().count()
    }

    fn busy_count(&self) -> usize {
        self.workers().filter(|w| w.is_busy()).count()
    }

    fn idle_count(&self) -> usize {
        self.workers().filter(|w| w.is_idle()).count()
    }

    fn first_idle_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|w| w.is_idle()))
    }

    fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn entry_mut(&mut self, slot: usize, id: WorkerId) -> Option<&mut WorkerEntry<I, O>> {
        self.slots
            .get_mut(slot)?
            .as_mut()
            .filter(|entry| entry.id() == id)
    }

    fn snapshot(&self) -> PoolMetrics {
        self.metrics.get_metrics(
            self.scheduler.queued_count(),
            self.busy_count(),
            self.idle_count(),
        )
    }
}

/// Side effects collected under the lock and run after it is released
#[derive(Default)]
struct Deferred {
    errors: Vec<WorkerPoolError>,
    file_io: Vec<WorkerFileIoStats>,
}

struct Shared<R: WorkerRoutine> {
    me: Weak<Shared<R>>,
    options: WorkerPoolOptions,
    factory: Box<RoutineFactory<R>>,
    state: Mutex<PoolState<R::Input, R::Output>>,
    #[cfg(feature = "metrics")]
    file_io: FileIoAggregator,
}

impl<R: WorkerRoutine> Shared<R> {
    fn run_deferred(&self, deferred: Deferred) {
        if let Some(handler) = self.options.error_handler() {
            for err in &deferred.errors {
                handler(err);
            }
        }
        if let Some(handler) = self.options.file_io_stats_handler() {
            for stats in &deferred.file_io {
                handler(stats);
            }
        }
    }

    fn shutting_down_error(&self, state: &PoolState<R::Input, R::Output>) -> WorkerPoolError {
        WorkerPoolError::shutting_down(&self.options.name, state.scheduler.queued_count())
    }

    /// Whether an idle worker in `slot` may be retired for idleness
    fn is_surplus(&self, state: &PoolState<R::Input, R::Output>, slot: usize) -> bool {
        slot >= self.options.min_concurrency && state.live_count() > self.options.min_concurrency
    }

    /// Start a worker in `slot`
    fn spawn_worker(
        &self,
        state: &mut PoolState<R::Input, R::Output>,
        slot: usize,
    ) -> std::result::Result<(), WorkerSpawnError> {
        let id = WorkerId::new(state.next_worker_id);
        state.next_worker_id += 1;

        let routine = (self.factory)(id).map_err(|err| {
            WorkerSpawnError::new(
                &self.options.name,
                slot,
                format!("Failed to initialise {}: {}", self.options.routine_label, err),
            )
            .with_source(Arc::from(err))
        })?;

        let supervisor: Weak<dyn Supervisor<R::Output>> = self.me.clone();
        let thread_name = format!("{}-{}", self.options.name, id.as_u64());
        let entry = WorkerEntry::spawn(slot, id, thread_name, routine, supervisor).map_err(|err| {
            WorkerSpawnError::new(&self.options.name, slot, "Cannot create worker thread")
                .with_source(Arc::new(err))
        })?;

        state.slots[slot] = Some(entry);
        let live = state.live_count();
        state.metrics.update_peak_worker_count(live);

        log::debug!(
            "Pool '{}' spawned {} in slot #{} ({} live)",
            self.options.name,
            id,
            slot,
            live
        );
        #[cfg(feature = "tracing")]
        crate::tracing::events::record_worker_spawned(&self.options.name, id, slot, live);

        Ok(())
    }

    /// Place a job: idle worker, new worker, or queue
    fn route(
        &self,
        state: &mut PoolState<R::Input, R::Output>,
        mut job: Job<R::Input, R::Output>,
        deferred: &mut Deferred,
    ) {
        loop {
            if let Some(err) = job.cancellation_error() {
                log::debug!("Job {} cancelled before dispatch", job.id());
                job.reject(err);
                return;
            }
            if state.shutting_down {
                let err = self.shutting_down_error(state);
                job.reject(err);
                return;
            }

            let slot = match state.first_idle_slot() {
                Some(slot) => slot,
                None => match state.first_free_slot() {
                    Some(slot) => match self.spawn_worker(state, slot) {
                        Ok(()) => slot,
                        Err(err) => {
                            log::error!("{}", err);
                            let err = WorkerPoolError::from(err);
                            deferred.errors.push(err.clone());
                            job.reject(err);
                            return;
                        }
                    },
                    None => {
                        log::debug!(
                            "Pool '{}' at capacity, queueing job {}",
                            self.options.name,
                            job.id()
                        );
                        state.scheduler.enqueue(job);
                        return;
                    }
                },
            };

            match self.dispatch(state, slot, job, deferred) {
                Ok(()) => return,
                Err(returned) => job = returned,
            }
        }
    }

    /// Hand a job to the worker in `slot`
    ///
    /// If the worker's thread is gone the entry is removed and the job is
    /// given back for re-routing.
    fn dispatch(
        &self,
        state: &mut PoolState<R::Input, R::Output>,
        slot: usize,
        job: Job<R::Input, R::Output>,
        deferred: &mut Deferred,
    ) -> std::result::Result<(), Job<R::Input, R::Output>> {
        let queue_wait = job.queue_wait();
        let job_id = job.id();
        let parts = job.into_dispatch();

        let Some(entry) = state.slots.get_mut(slot).and_then(Option::as_mut) else {
            return Err(Job::from_dispatch(parts));
        };
        let worker_id = entry.id();

        match entry.assign(parts) {
            Ok(()) => {
                state.metrics.record_queue_wait_time(queue_wait);
                log::debug!(
                    "Dispatched job {} to {} after {:?} in queue",
                    job_id,
                    worker_id,
                    queue_wait
                );
                #[cfg(feature = "tracing")]
                crate::tracing::events::record_dispatch(job_id, worker_id, queue_wait);
                Ok(())
            }
            Err(parts) => {
                state.slots[slot] = None;
                let err = WorkerPoolError::other(format!(
                    "{} in slot #{} of pool '{}' stopped unexpectedly",
                    worker_id, slot, self.options.name
                ));
                log::error!("{}", err);
                deferred.errors.push(err);
                Err(Job::from_dispatch(parts))
            }
        }
    }

    /// Remove a queued job whose token was cancelled
    fn cancel_queued(&self, job_id: JobId) {
        let removed = self.state.lock().scheduler.remove(job_id);
        if let Some(job) = removed {
            let err = job
                .cancellation_error()
                .unwrap_or_else(|| WorkerPoolError::cancelled(job_id, "cancelled"));
            log::debug!("Removed cancelled job {} from the queue", job_id);
            job.reject(err);
        }
    }

    fn complete(
        &self,
        state: &mut PoolState<R::Input, R::Output>,
        slot: usize,
        worker_id: WorkerId,
        report: CompletionReport<R::Output>,
        deferred: &mut Deferred,
    ) -> IdleInstruction {
        let CompletionReport {
            job_id,
            outcome,
            execution_time,
            file_io,
        } = report;

        let Some(entry) = state.entry_mut(slot, worker_id) else {
            // dropped from the arena by a shutdown that gave up on it
            log::warn!("{} reported job {} after being removed", worker_id, job_id);
            return IdleInstruction::Exit;
        };

        match entry.finish() {
            Some(in_flight) => {
                let succeeded = outcome.is_ok();
                if succeeded {
                    state.metrics.record_success(execution_time);
                } else {
                    state.metrics.record_failure(execution_time);
                }
                log::debug!(
                    "Job {} {} on {} in {:?}",
                    in_flight.job_id,
                    if succeeded { "completed" } else { "failed" },
                    worker_id,
                    in_flight.started_at.elapsed()
                );
                #[cfg(feature = "tracing")]
                crate::tracing::events::record_completion(job_id, worker_id, execution_time, succeeded);
                in_flight.completion.settle(outcome);
            }
            None => log::warn!("{} reported job {} while idle", worker_id, job_id),
        }

        if !file_io.is_empty() {
            #[cfg(feature = "metrics")]
            self.file_io.record(&file_io);
            deferred.file_io.push(file_io);
        }

        if state.shutting_down {
            // mailbox is closed; the thread drains and exits
            return IdleInstruction::Wait;
        }

        while let Some(job) = state.scheduler.dequeue() {
            if let Some(err) = job.cancellation_error() {
                job.reject(err);
                continue;
            }
            return match self.dispatch(state, slot, job, deferred) {
                Ok(()) => IdleInstruction::Wait,
                Err(job) => {
                    self.route(state, job, deferred);
                    IdleInstruction::Exit
                }
            };
        }

        match self.options.idle_timeout {
            Some(timeout) if self.is_surplus(state, slot) => {
                match state.entry_mut(slot, worker_id) {
                    Some(entry) => {
                        if entry.arm_timer(timeout) {
                            IdleInstruction::WaitFor(timeout)
                        } else {
                            IdleInstruction::Wait
                        }
                    }
                    None => IdleInstruction::Wait,
                }
            }
            _ => IdleInstruction::Wait,
        }
    }

    fn retire_idle(
        &self,
        state: &mut PoolState<R::Input, R::Output>,
        slot: usize,
        worker_id: WorkerId,
    ) -> IdleInstruction {
        if state.shutting_down {
            return IdleInstruction::Wait;
        }
        let surplus = self.is_surplus(state, slot);

        let Some(entry) = state.entry_mut(slot, worker_id) else {
            return IdleInstruction::Exit;
        };
        if entry.is_busy() {
            return IdleInstruction::Wait;
        }
        let Some(timer) = entry.timer() else {
            return IdleInstruction::Wait;
        };
        if let Some(remaining) = timer.remaining(Instant::now()) {
            return IdleInstruction::WaitFor(remaining);
        }
        if !surplus {
            entry.clear_timer();
            return IdleInstruction::Wait;
        }

        // the thread exits on its own; dropping the entry detaches it
        state.slots[slot] = None;
        let live = state.live_count();
        log::debug!(
            "Pool '{}' retired idle {} from slot #{} ({} live)",
            self.options.name,
            worker_id,
            slot,
            live
        );
        #[cfg(feature = "tracing")]
        crate::tracing::events::record_worker_retired(&self.options.name, worker_id, slot, live);
        IdleInstruction::Exit
    }
}

impl<R: WorkerRoutine> Supervisor<R::Output> for Shared<R> {
    fn report_completion(
        &self,
        slot: usize,
        worker_id: WorkerId,
        report: CompletionReport<R::Output>,
    ) -> IdleInstruction {
        let mut deferred = Deferred::default();
        let instruction = {
            let mut state = self.state.lock();
            self.complete(&mut state, slot, worker_id, report, &mut deferred)
        };
        self.run_deferred(deferred);
        instruction
    }

    fn idle_timeout_elapsed(&self, slot: usize, worker_id: WorkerId) -> IdleInstruction {
        let mut state = self.state.lock();
        self.retire_idle(&mut state, slot, worker_id)
    }
}

/// Pool of worker threads running one kind of [`WorkerRoutine`]
pub struct WorkerPool<R: WorkerRoutine> {
    shared: Arc<Shared<R>>,
}

impl<R: WorkerRoutine> WorkerPool<R> {
    /// Create a pool whose workers get their routine from `factory`
    ///
    /// `min_concurrency` workers are spawned immediately. A failure there is
    /// reported to the error handler and does not fail construction; later
    /// `execute` calls spawn workers on demand.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerPoolError::InvalidConfig`] if the options do not
    /// validate.
    pub fn new<F>(options: WorkerPoolOptions, factory: F) -> Result<Self>
    where
        F: Fn(WorkerId) -> std::result::Result<R, RoutineError> + Send + Sync + 'static,
    {
        options.validate()?;

        let max_concurrency = options.max_concurrency;
        let min_concurrency = options.min_concurrency;
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            options,
            factory: Box::new(factory),
            state: Mutex::new(PoolState::new(max_concurrency)),
            #[cfg(feature = "metrics")]
            file_io: FileIoAggregator::new(),
        });

        let mut deferred = Deferred::default();
        {
            let mut state = shared.state.lock();
            for slot in 0..min_concurrency {
                if let Err(err) = shared.spawn_worker(&mut state, slot) {
                    log::error!("{}", err);
                    deferred.errors.push(err.into());
                }
            }
        }
        shared.run_deferred(deferred);

        log::info!(
            "Worker pool '{}' started ({}..={} workers running {})",
            shared.options.name,
            min_concurrency,
            max_concurrency,
            shared.options.routine_label
        );

        Ok(Self { shared })
    }

    /// Create a pool that gives every worker a clone of `routine`
    pub fn with_routine(options: WorkerPoolOptions, routine: R) -> Result<Self>
    where
        R: Clone + Sync,
    {
        Self::new(options, move |_| Ok(routine.clone()))
    }

    /// Submit a job
    pub fn execute(&self, input: R::Input) -> JobHandle<R::Output> {
        self.execute_with_token(input, CancellationToken::new())
    }

    /// Submit a job that can be cancelled through `token`
    ///
    /// Cancelling while the job is queued rejects it with
    /// [`WorkerPoolError::Cancelled`] without it ever reaching a worker.
    pub fn execute_with_token(
        &self,
        input: R::Input,
        token: CancellationToken,
    ) -> JobHandle<R::Output> {
        let (mut job, handle) = Job::new(input, token);

        let job_id = job.id();
        let pool = Weak::clone(&self.shared.me);
        let guard = job.token().on_cancel(move || {
            if let Some(shared) = pool.upgrade() {
                shared.cancel_queued(job_id);
            }
        });
        job.attach_cancel_guard(guard);

        let mut deferred = Deferred::default();
        {
            let mut state = self.shared.state.lock();
            self.shared.route(&mut state, job, &mut deferred);
        }
        self.shared.run_deferred(deferred);

        handle
    }

    /// Submit every input and wait for all results, in input order
    #[cfg(feature = "async")]
    pub async fn execute_all<T>(&self, inputs: T) -> Vec<Result<R::Output>>
    where
        T: IntoIterator<Item = R::Input>,
    {
        let handles: Vec<_> = inputs.into_iter().map(|input| self.execute(input)).collect();
        futures::future::join_all(handles).await
    }

    /// Current metrics, with live counts taken from the worker set
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.state.lock().snapshot()
    }

    /// Zero the counters and start a new metrics window
    ///
    /// The peak worker count restarts at the current live count. With the
    /// `metrics` feature the file I/O summary is reset too.
    pub fn reset_metrics(&self) {
        {
            let mut state = self.shared.state.lock();
            state.metrics.reset();
            let live = state.live_count();
            state.metrics.update_peak_worker_count(live);
        }
        #[cfg(feature = "metrics")]
        self.shared.file_io.reset();
    }

    /// Jobs waiting for a worker
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().scheduler.queued_count()
    }

    /// Workers currently alive
    pub fn live_worker_count(&self) -> usize {
        self.shared.state.lock().live_count()
    }

    /// Workers running a job
    pub fn busy_worker_count(&self) -> usize {
        self.shared.state.lock().busy_count()
    }

    /// Workers waiting for a job
    pub fn idle_worker_count(&self) -> usize {
        self.shared.state.lock().idle_count()
    }

    /// Snapshot of every live worker, in slot order
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.shared
            .state
            .lock()
            .workers()
            .map(WorkerEntry::info)
            .collect()
    }

    /// File I/O totals across every job run so far
    #[cfg(feature = "metrics")]
    pub fn file_io_summary(&self) -> FileIoSummary {
        self.shared.file_io.summary()
    }

    /// True once shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.shared.options.name
    }

    /// Options the pool was created with
    pub fn options(&self) -> &WorkerPoolOptions {
        &self.shared.options
    }

    /// Stop the pool
    ///
    /// Queued jobs are rejected with [`WorkerPoolError::ShuttingDown`],
    /// running jobs finish and resolve normally, and worker threads are
    /// joined for at most `join_timeout` each. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first worker that failed to join in time or panicked.
    pub fn shutdown(&self) -> Result<()> {
        let (rejected, threads) = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;

            let rejected = state.scheduler.clear();
            let mut threads = Vec::new();
            for entry in state.slots.iter_mut().flatten() {
                entry.clear_timer();
                entry.terminate();
                if let Some(thread) = entry.take_thread() {
                    threads.push((entry.id(), thread));
                }
            }
            (rejected, threads)
        };

        let pending_jobs = rejected.len();
        log::info!(
            "Shutting down worker pool '{}' ({} workers, {} queued jobs rejected)",
            self.shared.options.name,
            threads.len(),
            pending_jobs
        );
        #[cfg(feature = "tracing")]
        crate::tracing::events::record_pool_shutdown(&self.shared.options.name, threads.len(), pending_jobs);

        for job in rejected {
            job.reject(WorkerPoolError::shutting_down(
                &self.shared.options.name,
                pending_jobs,
            ));
        }

        let mut first_error = None;
        for (id, thread) in threads {
            if let Err(err) = join_with_timeout(id, thread, self.shared.options.join_timeout) {
                log::error!("{}", err);
                first_error.get_or_insert(err);
            }
        }

        // workers that did not stop in time lose their in-flight job
        let abandoned: Vec<_> = self
            .shared
            .state
            .lock()
            .slots
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        drop(abandoned);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<R: WorkerRoutine> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Worker pool '{}' shutdown failed: {}", self.name(), err);
        }
    }
}

impl<R: WorkerRoutine> fmt::Debug for WorkerPool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.options.name)
            .field("live_workers", &state.live_count())
            .field("queued_jobs", &state.scheduler.queued_count())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
