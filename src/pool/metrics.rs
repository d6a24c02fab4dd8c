//! Pool-level counters
//!
//! [`MetricsCollector`] only accumulates what the pool reports to it. It
//! does not know which workers exist, so live counts are supplied by the
//! caller when a [`PoolMetrics`] snapshot is taken.

use serde::Serialize;
use std::time::Duration;

/// Snapshot of pool activity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Jobs waiting for a worker
    pub queued_count: usize,
    /// Workers running a job
    pub busy_count: usize,
    /// Workers waiting for a job
    pub idle_count: usize,
    /// Live workers (`busy_count + idle_count`)
    pub worker_count: usize,
    /// Jobs that resolved
    pub success_count: u64,
    /// Jobs that were rejected by their worker
    pub failure_count: u64,
    /// Jobs that reached a worker and finished either way
    pub completed_jobs_count: u64,
    /// Execution time summed over completed jobs
    pub total_execution_time_ms: f64,
    /// Mean execution time, 0 before the first completion
    pub average_execution_time_ms: f64,
    /// Queue wait summed over dispatched jobs
    pub total_queue_wait_time_ms: f64,
    /// Mean queue wait, 0 before the first dispatch
    pub average_queue_wait_time_ms: f64,
    /// Most workers alive at once since the last reset
    pub peak_worker_count: usize,
}

impl PoolMetrics {
    /// Share of completed jobs that succeeded, in percent
    ///
    /// 100 when nothing has completed yet.
    pub fn success_rate(&self) -> f64 {
        if self.completed_jobs_count == 0 {
            100.0
        } else {
            (self.success_count as f64 / self.completed_jobs_count as f64) * 100.0
        }
    }
}

/// Running totals fed by the pool
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    success_count: u64,
    failure_count: u64,
    completed_jobs_count: u64,
    total_execution_time_ms: f64,
    total_queue_wait_time_ms: f64,
    queue_wait_samples: u64,
    peak_worker_count: usize,
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

impl MetricsCollector {
    /// Create a collector with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// A job resolved after running for `execution_time`
    pub fn record_success(&mut self, execution_time: Duration) {
        self.success_count += 1;
        self.record_completion(execution_time);
    }

    /// A job was rejected by its worker after `execution_time`
    pub fn record_failure(&mut self, execution_time: Duration) {
        self.failure_count += 1;
        self.record_completion(execution_time);
    }

    fn record_completion(&mut self, execution_time: Duration) {
        self.completed_jobs_count += 1;
        self.total_execution_time_ms += as_ms(execution_time);
    }

    /// A job left the queue after waiting `wait`
    pub fn record_queue_wait_time(&mut self, wait: Duration) {
        self.total_queue_wait_time_ms += as_ms(wait);
        self.queue_wait_samples += 1;
    }

    /// Raise the high-water mark if `live_workers` exceeds it
    pub fn update_peak_worker_count(&mut self, live_workers: usize) {
        self.peak_worker_count = self.peak_worker_count.max(live_workers);
    }

    /// Zero every counter
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current high-water mark
    pub fn peak_worker_count(&self) -> usize {
        self.peak_worker_count
    }

    /// Combine live counts with the accumulated counters
    pub fn get_metrics(&self, queued_count: usize, busy_count: usize, idle_count: usize) -> PoolMetrics {
        PoolMetrics {
            queued_count,
            busy_count,
            idle_count,
            worker_count: busy_count + idle_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            completed_jobs_count: self.completed_jobs_count,
            total_execution_time_ms: self.total_execution_time_ms,
            average_execution_time_ms: average(
                self.total_execution_time_ms,
                self.completed_jobs_count,
            ),
            total_queue_wait_time_ms: self.total_queue_wait_time_ms,
            average_queue_wait_time_ms: average(
                self.total_queue_wait_time_ms,
                self.queue_wait_samples,
            ),
            peak_worker_count: self.peak_worker_count,
        }
    }
}
