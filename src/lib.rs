//! # Agent Log Workers
//!
//! An elastic worker pool for parsing AI-agent session logs off the request
//! path.
//!
//! ## Features
//!
//! - **Elastic Pool**: between `min_concurrency` and `max_concurrency` worker threads
//! - **FIFO Queue**: jobs wait in arrival order when every worker is busy
//! - **Idle Recycling**: surplus workers retire after an idle timeout
//! - **Metrics**: success/failure counts, execution and queue-wait times, peak workers
//! - **File I/O Instrumentation**: per-job record of every file system call a routine makes
//! - **Cancellation**: queued jobs can be withdrawn, running jobs observe their token
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_log_workers::prelude::*;
//! use std::io::Write;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut file = tempfile::NamedTempFile::new()?;
//! writeln!(file, r#"{{"type":"session_start"}}"#)?;
//! writeln!(file, r#"{{"type":"tool_call","name":"grep"}}"#)?;
//!
//! let pool = WorkerPool::with_routine(
//!     WorkerPoolOptions::new(1, 4).with_name("event-logs"),
//!     EventLogLoader::new(),
//! )?;
//!
//! let log = pool.execute(EventLogRequest::new(file.path())).wait()?;
//! assert_eq!(log.events.len(), 2);
//!
//! let metrics = pool.metrics();
//! assert_eq!(metrics.success_count, 1);
//!
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Routines
//!
//! ```rust
//! use agent_log_workers::prelude::*;
//!
//! struct CountSteps;
//!
//! impl WorkerRoutine for CountSteps {
//!     type Input = std::path::PathBuf;
//!     type Output = usize;
//!
//!     fn run(&mut self, path: Self::Input, ctx: &JobContext<'_>) -> std::result::Result<usize, RoutineError> {
//!         let text = ctx.io().read_to_string(&path)?;
//!         Ok(text.matches("\"step\"").count())
//!     }
//!
//!     fn name(&self) -> &str {
//!         "CountSteps"
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let pool = WorkerPool::new(WorkerPoolOptions::new(0, 2), |_worker| Ok(CountSteps))?;
//! # pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod event_log;
pub mod io;
pub mod pool;
pub mod prelude;
pub mod tracing;

pub use crate::core::{
    CancellationToken, FnRoutine, JobContext, JobHandle, JobId, Result, WorkerPoolError,
    WorkerRoutine,
};
pub use crate::event_log::{EventLog, EventLogLoader, EventLogRequest};
pub use crate::pool::{PoolMetrics, WorkerPool, WorkerPoolOptions};
