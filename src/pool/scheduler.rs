//! FIFO queue of jobs waiting for a worker

use crate::core::{Job, JobId};
use std::collections::VecDeque;

/// Pending jobs in arrival order
///
/// A plain data structure: the pool serializes every access under its own
/// lock and is responsible for notifying jobs it removes.
#[derive(Debug)]
pub struct JobScheduler<I, O> {
    jobs: VecDeque<Job<I, O>>,
}

impl<I, O> Default for JobScheduler<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> JobScheduler<I, O> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
        }
    }

    /// Append a job
    pub fn enqueue(&mut self, job: Job<I, O>) {
        self.jobs.push_back(job);
    }

    /// Remove and return the oldest job
    pub fn dequeue(&mut self) -> Option<Job<I, O>> {
        self.jobs.pop_front()
    }

    /// Remove a specific job, wherever it sits in the queue
    pub fn remove(&mut self, job_id: JobId) -> Option<Job<I, O>> {
        let position = self.jobs.iter().position(|job| job.id() == job_id)?;
        self.jobs.remove(position)
    }

    /// Number of queued jobs
    pub fn queued_count(&self) -> usize {
        self.jobs.len()
    }

    /// True if at least one job is waiting
    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Empty the queue without running any callback
    ///
    /// The drained jobs are returned in FIFO order; the caller decides how
    /// to notify them.
    pub fn clear(&mut self) -> Vec<Job<I, O>> {
        self.jobs.drain(..).collect()
    }
}
