//! Event-log loading, the pool's primary workload
//!
//! Agent session logs come in two shapes: a JSON array of event records,
//! or JSON Lines with one record per line. [`EventLogLoader`] reads either
//! through the worker's instrumented I/O so every load shows up in the
//! file I/O stats. Record shapes are not validated here.

use crate::core::{JobContext, RoutineError, WorkerRoutine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Failures that reject an event-log job
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The file could not be read
    #[error("Failed to read event log {path}: {source}")]
    Read {
        /// Path of the log
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file starts with `[` but is not a valid JSON array
    #[error("Event log {path} is not a valid JSON array: {source}")]
    InvalidArray {
        /// Path of the log
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },
}

/// One event log to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogRequest {
    /// Path of the log file
    pub path: PathBuf,
    /// Stop after this many events
    #[serde(default)]
    pub max_events: Option<usize>,
}

impl EventLogRequest {
    /// Load the whole file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_events: None,
        }
    }

    /// Load at most `max` events
    #[must_use]
    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }
}

/// A loaded event log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLog {
    /// Path the events came from
    pub path: PathBuf,
    /// Parsed event records, in file order
    pub events: Vec<Value>,
    /// JSONL lines that failed to parse
    pub malformed_lines: usize,
    /// Size of the file
    pub bytes_read: u64,
    /// True if `max_events` cut the log short
    pub truncated: bool,
}

/// Routine that loads event logs
#[derive(Debug, Clone, Default)]
pub struct EventLogLoader;

impl EventLogLoader {
    /// Create a loader
    pub fn new() -> Self {
        Self
    }
}

fn is_json_array(text: &str) -> bool {
    text.trim_start().starts_with('[')
}

impl WorkerRoutine for EventLogLoader {
    type Input = EventLogRequest;
    type Output = EventLog;

    fn run(&mut self, request: EventLogRequest, ctx: &JobContext<'_>) -> Result<EventLog, RoutineError> {
        let EventLogRequest { path, max_events } = request;
        let limit = max_events.unwrap_or(usize::MAX);

        let text = ctx
            .io()
            .read_to_string(&path)
            .map_err(|source| EventLogError::Read {
                path: path.clone(),
                source,
            })?;
        let bytes_read = text.len() as u64;
        ctx.check_cancelled()?;

        let mut events = Vec::new();
        let mut malformed_lines = 0;
        let mut truncated = false;

        if is_json_array(&text) {
            events = serde_json::from_str::<Vec<Value>>(&text).map_err(|source| {
                EventLogError::InvalidArray {
                    path: path.clone(),
                    source,
                }
            })?;
            if events.len() > limit {
                events.truncate(limit);
                truncated = true;
            }
        } else {
            for (index, line) in text.lines().enumerate() {
                ctx.check_cancelled()?;

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if events.len() == limit {
                    truncated = true;
                    break;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        log::debug!(
                            "Skipping malformed line {} of {}: {}",
                            index + 1,
                            path.display(),
                            err
                        );
                        malformed_lines += 1;
                    }
                }
            }
        }

        Ok(EventLog {
            path,
            events,
            malformed_lines,
            bytes_read,
            truncated,
        })
    }

    fn name(&self) -> &str {
        "EventLogLoader"
    }
}
