//! Dispatch error taxonomy
//!
//! Only queue rejection, timeout, ladder exhaustion, malformed output and
//! cancellation are visible as job outcomes. Per-call backend failures are
//! absorbed by escalation inside the router and never appear here.

use std::time::Duration;

use thiserror::Error;

use crate::job::{Complexity, JobId, TaskKind};
use crate::resource_pool::PoolError;

/// Errors surfaced by the dispatcher and recorded on failed jobs
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DispatchError {
    /// Admission queue is at its configured maximum
    #[error("admission queue is full (max {max} jobs)")]
    QueueFull {
        /// Configured queue capacity
        max: usize,
    },

    /// Job exceeded its wall-clock budget
    #[error("job exceeded its wall-clock budget of {budget:?}")]
    Timeout {
        /// The budget that was exceeded
        budget: Duration,
    },

    /// Every ladder entry was open, over capacity, or failing
    #[error("no backend could serve the call ({attempted} of {ladder_len} ladder entries attempted)")]
    NoCapacityAvailable {
        /// Backends actually called
        attempted: usize,
        /// Ladder length
        ladder_len: usize,
    },

    /// No ladder is configured for the pair
    #[error("no escalation ladder configured for {task_kind}/{complexity}")]
    UnknownTaskKind {
        task_kind: TaskKind,
        complexity: Complexity,
    },

    /// Stage output failed structural validation twice
    #[error("malformed output from backend {backend}: {reason}")]
    MalformedOutput { backend: String, reason: String },

    #[error("job was cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("job has no stages")]
    EmptyJob,

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("resource pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    /// Stable short name for reports and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::Timeout { .. } => "timeout",
            Self::NoCapacityAvailable { .. } => "no_capacity_available",
            Self::UnknownTaskKind { .. } => "unknown_task_kind",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Cancelled => "cancelled",
            Self::JobNotFound(_) => "job_not_found",
            Self::UnknownBackend(_) => "unknown_backend",
            Self::EmptyJob => "empty_job",
            Self::ShuttingDown => "shutting_down",
            Self::AlreadyStarted => "already_started",
            Self::Pool(_) => "pool",
            Self::Config(_) => "config",
        }
    }

    /// Whether the caller may retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

impl From<crate::config::ConfigError> for DispatchError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
