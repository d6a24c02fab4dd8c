//! Worker pool configuration

use crate::core::{Result, WorkerPoolError};
use crate::io::WorkerFileIoStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Receives pool-scoped errors such as spawn failures and dead workers
pub type ErrorHandler = Arc<dyn Fn(&WorkerPoolError) + Send + Sync>;

/// Receives the file I/O a job performed, once per job with non-empty stats
pub type FileIoStatsHandler = Arc<dyn Fn(&WorkerFileIoStats) + Send + Sync>;

/// Default idle time after which a surplus worker is retired
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long shutdown waits for each worker thread
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`WorkerPool`](crate::pool::WorkerPool)
#[derive(Clone)]
pub struct WorkerPoolOptions {
    /// Workers spawned up front and never retired for idleness
    pub min_concurrency: usize,
    /// Hard ceiling on live workers
    pub max_concurrency: usize,
    /// Idle time after which a worker above `min_concurrency` is retired.
    /// `None` keeps every worker until shutdown.
    pub idle_timeout: Option<Duration>,
    /// Pool name, used as the worker thread name prefix
    pub name: String,
    /// Label for the routine the workers run, used in logs
    pub routine_label: String,
    /// How long shutdown waits for each worker thread
    pub join_timeout: Duration,
    error_handler: Option<ErrorHandler>,
    on_file_io_stats: Option<FileIoStatsHandler>,
}

impl std::fmt::Debug for WorkerPoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolOptions")
            .field("min_concurrency", &self.min_concurrency)
            .field("max_concurrency", &self.max_concurrency)
            .field("idle_timeout", &self.idle_timeout)
            .field("name", &self.name)
            .field("routine_label", &self.routine_label)
            .field("join_timeout", &self.join_timeout)
            .field("error_handler", &self.error_handler.as_ref().map(|_| "<handler>"))
            .field(
                "on_file_io_stats",
                &self.on_file_io_stats.as_ref().map(|_| "<handler>"),
            )
            .finish()
    }
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 0,
            max_concurrency: num_cpus::get(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            name: "worker-pool".to_string(),
            routine_label: "routine".to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            error_handler: None,
            on_file_io_stats: None,
        }
    }
}

impl WorkerPoolOptions {
    /// Options with the given concurrency bounds
    #[must_use]
    pub fn new(min_concurrency: usize, max_concurrency: usize) -> Self {
        Self {
            min_concurrency,
            max_concurrency,
            ..Default::default()
        }
    }

    /// Build options from deserialized settings
    ///
    /// Fields missing from the settings keep their defaults; handlers are
    /// never part of settings and must be attached afterwards.
    pub fn from_settings(settings: &PoolSettings) -> Self {
        let defaults = Self::default();
        Self {
            min_concurrency: settings.min_concurrency.unwrap_or(defaults.min_concurrency),
            max_concurrency: settings.max_concurrency.unwrap_or(defaults.max_concurrency),
            idle_timeout: match settings.idle_timeout_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.idle_timeout,
            },
            name: settings.name.clone().unwrap_or(defaults.name),
            join_timeout: settings
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.join_timeout),
            ..defaults
        }
    }

    /// Set the number of long-lived workers
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_min_concurrency(mut self, min: usize) -> Self {
        self.min_concurrency = min;
        self
    }

    /// Set the worker ceiling
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the idle timeout for workers above `min_concurrency`
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep surplus workers alive until shutdown
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set the pool name
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the routine label used in logs
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_routine_label<S: Into<String>>(mut self, label: S) -> Self {
        self.routine_label = label.into();
        self
    }

    /// Set how long shutdown waits for each worker thread
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the handler for pool-scoped errors
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkerPoolError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Set the sink for per-job file I/O stats
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_file_io_stats_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkerFileIoStats) + Send + Sync + 'static,
    {
        self.on_file_io_stats = Some(Arc::new(handler));
        self
    }

    pub(crate) fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    pub(crate) fn file_io_stats_handler(&self) -> Option<&FileIoStatsHandler> {
        self.on_file_io_stats.as_ref()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(WorkerPoolError::invalid_config(
                "max_concurrency",
                "Maximum concurrency must be greater than 0",
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(WorkerPoolError::invalid_config(
                "min_concurrency",
                format!(
                    "Minimum concurrency {} exceeds maximum concurrency {}",
                    self.min_concurrency, self.max_concurrency
                ),
            ));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(WorkerPoolError::invalid_config(
                "idle_timeout",
                "Idle timeout must be non-zero; use without_idle_timeout() to disable it",
            ));
        }
        if self.name.is_empty() {
            return Err(WorkerPoolError::invalid_config(
                "name",
                "Pool name must not be empty",
            ));
        }
        Ok(())
    }
}

/// Serializable pool sizing, as found in a dashboard config file
///
/// Every field is optional; see [`WorkerPoolOptions::from_settings`].
/// An `idle_timeout_ms` of 0 disables idle retirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSettings {
    /// Long-lived workers
    pub min_concurrency: Option<usize>,
    /// Worker ceiling
    pub max_concurrency: Option<usize>,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: Option<u64>,
    /// Pool name
    pub name: Option<String>,
    /// Shutdown join timeout in milliseconds
    pub join_timeout_ms: Option<u64>,
}
