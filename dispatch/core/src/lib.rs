//! Dispatch Core - Admission Control and Backend Dispatch for LLM Pipelines
//!
//! This crate admits multi-stage jobs into a bounded queue, runs them on a
//! fixed pool of workers, and routes every stage call across a ladder of
//! external model backends guarded by rate limits and circuit breakers.
//! It has no transport of its own: backends are reached through the
//! [`BackendAdapter`] trait and results leave through a report channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Dispatcher                              │
//! │                                                                   │
//! │  submit ──> ┌────────────────┐   dequeue   ┌──────────────────┐   │
//! │             │ AdmissionQueue │ ──────────> │    WorkerPool    │   │
//! │  cancel ──> │ (bounded FIFO) │             │  (N tokio tasks) │   │
//! │             └────────────────┘             └────────┬─────────┘   │
//! │                                                     │             │
//! │             ┌────────────────┐    lease             │ per stage   │
//! │             │  ResourcePool  │ <────────────────────┤             │
//! │             └────────────────┘                      ▼             │
//! │  ┌───────────────────────────────────────────────────────────┐    │
//! │  │                       ModelRouter                          │    │
//! │  │  LadderTable ──> CircuitRegistry ──> RateLimiter ──> call  │    │
//! │  └────────────────────────────┬──────────────────────────────┘    │
//! │                               │                                   │
//! │  JobRegistry <── state/cost ──┤                                   │
//! │  DispatchMetrics <── counts ──┘          JobReport ──> mpsc       │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │
//!                     BackendAdapter (async trait)
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: owns every component; `submit`, `status`, `cancel`,
//!   `queue_info`, `shutdown`
//! - [`JobSpec`] / [`Stage`]: what a client submits
//! - [`ModelRouter`]: ladder walking, escalation, cost accounting
//! - [`CircuitBreaker`] and [`RateLimiter`]: per-backend admission
//! - [`ResourcePool`]: bounded set of leased execution contexts
//! - [`DispatchConfig`]: validated TOML configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use dispatch_core::{load_config, Dispatcher, JobSpec};
//!
//! let config = load_config(None)?;
//! let dispatcher = Dispatcher::new(config, adapters)?;
//! let mut reports = dispatcher.start().await?;
//!
//! let submission = dispatcher.submit(spec)?;
//! while let Some(report) = reports.recv().await {
//!     println!("{} -> {}", report.job_id, report.state);
//! }
//! dispatcher.shutdown().await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod resource_pool;
pub mod routing;
pub mod worker;

// Re-exports for convenience
pub use config::{
    default_config_path, load_config, load_config_from_path, BackendConfig, ConfigError,
    DispatchConfig,
};
pub use dispatcher::{Dispatcher, JobStatus, QueueInfo, Submission, SystemLoad};
pub use error::DispatchError;
pub use job::{
    CancelFlag, Complexity, CostEntry, CostLedger, Job, JobId, JobSpec, JobState, OutputCheck,
    Stage, StageKind, StageOutput, TaskKind,
};
pub use metrics::{DispatchMetrics, DurationEstimator, MetricsSnapshot};
pub use queue::{AdmissionQueue, QueueTicket};
pub use registry::{JobRecord, JobRegistry};
pub use resource_pool::{ExecutionContext, Lease, PoolError, PoolStats, ResourcePool};
pub use routing::{
    AdapterError, AdapterRequest, AdapterResponse, AdapterSet, Backend, BackendAdapter,
    BreakerConfig, CircuitBreaker, CircuitRegistry, CircuitSnapshot, CircuitState,
    Classification, CostModel, EscalationLadder, Invocation, LadderTable, ModelRouter,
    RateLimitConfig, RateLimiter,
};
pub use worker::{JobReport, WorkerContext, WorkerPool};
