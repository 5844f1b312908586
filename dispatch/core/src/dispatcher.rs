//! Dispatcher
//!
//! The context object that owns every dispatch component. Nothing here is a
//! process-wide global: construct a [`Dispatcher`], share it by `Arc`, and
//! shut it down explicitly.
//!
//! # Lifecycle
//!
//! ```text
//! Dispatcher::new(config, adapters)
//!     │
//!     ├─ start() ─────────> spawns workers (and the purge sweep when
//!     │                     retention is set), hands out the report receiver
//!     ├─ submit / status / cancel / queue_info
//!     └─ shutdown() ──────> closes the queue, waits for workers, drains the pool
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::job::{Job, JobId, JobSpec, JobState};
use crate::metrics::{DispatchMetrics, DurationEstimator, MetricsSnapshot};
use crate::queue::AdmissionQueue;
use crate::registry::{JobRecord, JobRegistry};
use crate::resource_pool::{ExecutionContext, PoolStats, ResourcePool};
use crate::routing::{AdapterSet, CircuitSnapshot, ModelRouter};
use crate::worker::{JobReport, WorkerContext, WorkerPool};

// ============================================================================
// Public Views
// ============================================================================

/// Result of `submit`
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub state: JobState,

    /// 1-based queue position while queued
    pub position: Option<usize>,

    #[serde(serialize_with = "optional_secs")]
    pub eta: Option<Duration>,

    /// The id was already active; nothing new was enqueued
    pub duplicate: bool,
}

/// Non-blocking snapshot of one job
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub queue_position: Option<usize>,

    #[serde(serialize_with = "optional_secs")]
    pub eta: Option<Duration>,

    pub accumulated_cost: f64,
    pub stages_done: usize,
    pub stage_count: usize,

    #[serde(serialize_with = "optional_error")]
    pub error: Option<DispatchError>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Coarse load level derived from queue depth
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLoad {
    /// Nothing waiting and a worker is free
    Healthy,
    Normal,
    /// Queue at least half full
    Busy,
    /// Queue full; submissions are rejected
    AtCapacity,
}

impl SystemLoad {
    #[must_use]
    pub fn classify(queue_size: usize, max_queue_size: usize, running: usize, workers: usize) -> Self {
        if queue_size >= max_queue_size {
            Self::AtCapacity
        } else if queue_size == 0 && running < workers {
            Self::Healthy
        } else if queue_size * 2 >= max_queue_size {
            Self::Busy
        } else {
            Self::Normal
        }
    }
}

/// Queue and worker occupancy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub running: usize,
    pub worker_pool_size: usize,
    pub available_slots: usize,
    pub resources: PoolStats,
    pub load: SystemLoad,
}

fn optional_secs<S: serde::Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

fn optional_error<S: serde::Serializer>(value: &Option<DispatchError>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Upper bound on the gap between two retention sweeps
const MAX_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    config: DispatchConfig,
    context: Arc<WorkerContext>,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    purger: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobReport>>>,
}

impl Dispatcher {
    /// Validate configuration and assemble every component
    ///
    /// Each configured backend needs an adapter in `adapters`.
    pub fn new(config: DispatchConfig, adapters: AdapterSet) -> Result<Self, DispatchError> {
        config.validate()?;

        let metrics = Arc::new(DispatchMetrics::new());
        let estimator = Arc::new(DurationEstimator::new());
        let router = ModelRouter::from_config(&config, adapters, Arc::clone(&metrics))?;
        let queue = AdmissionQueue::new(
            config.queue_max_size,
            config.worker_pool_size,
            Arc::clone(&estimator),
        );
        let pool = ResourcePool::with_factory(config.resource_pool_size, ExecutionContext::new);
        let (tx, rx) = mpsc::unbounded_channel();

        let context = WorkerContext::new(
            Arc::new(queue),
            Arc::new(router),
            pool,
            Arc::new(JobRegistry::new()),
            metrics,
            estimator,
            config.job_budget,
            tx,
        );

        tracing::info!(
            workers = config.worker_pool_size,
            queue_max = config.queue_max_size,
            resources = config.resource_pool_size,
            backends = config.backends.len(),
            ladders = config.ladders.len(),
            "Dispatcher configured"
        );

        Ok(Self {
            config,
            context: Arc::new(context),
            workers: tokio::sync::Mutex::new(None),
            purger: Mutex::new(None),
            receiver: Mutex::new(Some(rx)),
        })
    }

    /// Spawn the worker pool and take the report stream
    ///
    /// Must run inside a tokio runtime. A second call fails with
    /// `AlreadyStarted`.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<JobReport>, DispatchError> {
        let receiver = self.receiver.lock().take().ok_or(DispatchError::AlreadyStarted)?;
        let pool = WorkerPool::spawn(self.config.worker_pool_size, Arc::clone(&self.context));
        *self.workers.lock().await = Some(pool);
        if let Some(retention) = self.config.retention {
            *self.purger.lock() = Some(self.spawn_purger(retention));
        }
        Ok(receiver)
    }

    /// Periodically forget finished jobs older than `retention`
    fn spawn_purger(&self, retention: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&self.context.registry);
        let every = retention.min(MAX_PURGE_INTERVAL);
        tracing::debug!(retention_secs = retention.as_secs(), "Retention sweep started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = registry.purge_finished(retention_cutoff(retention));
                if purged > 0 {
                    tracing::debug!(purged, "Purged finished jobs");
                }
            }
        })
    }

    /// Admit a job to the queue
    ///
    /// Re-submitting an id that is still queued or running returns its
    /// current standing instead of enqueuing it twice.
    pub fn submit(&self, spec: JobSpec) -> Result<Submission, DispatchError> {
        if let Err(err) = self.admissible(&spec) {
            self.context.metrics.record_rejected();
            tracing::warn!(error = %err, "Job rejected");
            return Err(err);
        }

        let id = spec.id.clone().unwrap_or_else(JobId::generate);
        let job = Job::from_spec(id.clone(), spec);

        let replaced = match self.context.registry.admit(id.clone(), JobRecord::queued(&job)) {
            Ok(replaced) => replaced,
            Err(state) => {
                let ticket = self.context.queue.ticket(&id);
                tracing::debug!(job_id = %id, state = %state, "Duplicate submission");
                return Ok(Submission {
                    job_id: id,
                    state,
                    position: ticket.map(|t| t.position),
                    eta: ticket.and_then(|t| t.eta),
                    duplicate: true,
                });
            }
        };

        match self.context.queue.enqueue(job) {
            Ok(ticket) => {
                self.context.metrics.record_submitted();
                tracing::info!(
                    job_id = %id,
                    position = ticket.position,
                    eta_secs = ticket.eta.map(|d| d.as_secs()),
                    "Job queued"
                );
                Ok(Submission {
                    job_id: id,
                    state: JobState::Queued,
                    position: Some(ticket.position),
                    eta: ticket.eta,
                    duplicate: false,
                })
            }
            Err(err) => {
                self.context.registry.revert_admit(&id, replaced);
                self.context.metrics.record_rejected();
                tracing::warn!(job_id = %id, error = %err, "Job rejected");
                Err(err)
            }
        }
    }

    fn admissible(&self, spec: &JobSpec) -> Result<(), DispatchError> {
        if spec.stages.is_empty() {
            return Err(DispatchError::EmptyJob);
        }
        if self.context.queue.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        self.context.router.resolve(spec.task_kind, spec.complexity)?;
        Ok(())
    }

    /// Current state, queue position, ETA and cost of a job
    pub fn status(&self, id: &JobId) -> Result<JobStatus, DispatchError> {
        let record = self
            .context
            .registry
            .get(id)
            .ok_or_else(|| DispatchError::JobNotFound(id.clone()))?;

        let ticket = match record.state {
            JobState::Queued => self.context.queue.ticket(id),
            _ => None,
        };

        Ok(JobStatus {
            job_id: id.clone(),
            state: record.state,
            queue_position: ticket.map(|t| t.position),
            eta: ticket.and_then(|t| t.eta),
            accumulated_cost: record.cost.total(),
            stages_done: record.stages_done,
            stage_count: record.stage_count,
            error: record.error,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }

    /// Request cancellation
    ///
    /// A queued job is removed and reported as cancelled immediately. A
    /// running job has its flag raised and stops at its next checkpoint.
    /// Returns `false` for unknown or already finished jobs.
    pub fn cancel(&self, id: &JobId) -> bool {
        match self.context.registry.request_cancel(id) {
            Some(state) if state.is_active() => {}
            _ => return false,
        }

        if let Some(job) = self.context.queue.cancel(id) {
            if self
                .context
                .registry
                .finish(id, JobState::Cancelled, Some(DispatchError::Cancelled))
            {
                self.context.metrics.record_cancelled();
                if self
                    .context
                    .reports
                    .send(JobReport::cancelled_in_queue(&job))
                    .is_err()
                {
                    tracing::debug!(job_id = %id, "Report receiver dropped");
                }
            }
            tracing::info!(job_id = %id, "Queued job cancelled");
        } else {
            tracing::info!(job_id = %id, "Cancellation requested for running job");
        }
        true
    }

    /// Queue depth, worker occupancy and load level
    #[must_use]
    pub fn queue_info(&self) -> QueueInfo {
        let queue_size = self.context.queue.len();
        let max_queue_size = self.context.queue.max_size();
        let running = self.context.running();
        let workers = self.config.worker_pool_size;

        QueueInfo {
            queue_size,
            max_queue_size,
            running,
            worker_pool_size: workers,
            available_slots: workers.saturating_sub(running),
            resources: self.context.pool.stats(),
            load: SystemLoad::classify(queue_size, max_queue_size, running, workers),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }

    /// Breaker state per backend, sorted by backend id
    #[must_use]
    pub fn circuit_states(&self) -> Vec<(String, CircuitSnapshot)> {
        self.context.router.circuit_snapshots()
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Forget finished jobs older than `age`
    pub fn purge_finished(&self, age: Duration) -> usize {
        self.context.registry.purge_finished(retention_cutoff(age))
    }

    /// Stop accepting jobs, let workers finish what is queued, and return
    /// the execution contexts
    pub async fn shutdown(&self) -> Result<Vec<ExecutionContext>, DispatchError> {
        tracing::info!(queued = self.context.queue.len(), "Dispatcher shutting down");
        self.context.queue.close();

        if let Some(pool) = self.workers.lock().await.take() {
            pool.join().await;
        }
        if let Some(purger) = self.purger.lock().take() {
            purger.abort();
        }

        let resources = self.context.pool.drain().await?;
        tracing::info!(
            resources = resources.len(),
            metrics = ?self.context.metrics.snapshot(),
            "Dispatcher stopped"
        );
        Ok(resources)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(purger) = self.purger.get_mut().take() {
            purger.abort();
        }
    }
}

fn retention_cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ============================================================================
// Tests
// ============================================================================
