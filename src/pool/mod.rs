//! The elastic worker pool and its collaborators

pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod worker;
mod worker_pool;

pub use config::{
    ErrorHandler, FileIoStatsHandler, PoolSettings, WorkerPoolOptions, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_JOIN_TIMEOUT,
};
pub use metrics::{MetricsCollector, PoolMetrics};
pub use scheduler::JobScheduler;
pub use worker::{WorkerId, WorkerInfo};
pub use worker_pool::WorkerPool;
