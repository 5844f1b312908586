//! Worker Pool
//!
//! A fixed set of tokio tasks pulling jobs off the admission queue. Each
//! worker runs one job at a time, stage by stage, under the job's wall-clock
//! budget, and publishes exactly one [`JobReport`] per job it finishes.
//!
//! ```text
//!   AdmissionQueue ──dequeue──> worker ──stage──> [lease] ──> ModelRouter
//!                                  │                              │
//!                                  │<────────── Invocation ───────┘
//!                                  ▼
//!                    JobRegistry + DispatchMetrics + JobReport
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::DispatchError;
use crate::job::{Job, JobId, JobState, StageOutput};
use crate::metrics::{DispatchMetrics, DurationEstimator};
use crate::queue::AdmissionQueue;
use crate::registry::JobRegistry;
use crate::resource_pool::{ExecutionContext, ResourcePool};
use crate::routing::{CallContext, ModelRouter};

// ============================================================================
// Job Report
// ============================================================================

/// Terminal outcome of one job
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,

    /// Accumulated cost across every backend call
    pub cost: f64,

    #[serde(serialize_with = "error_text")]
    pub error: Option<DispatchError>,

    /// Time spent on a worker; zero for jobs cancelled while queued
    #[serde(serialize_with = "duration_secs")]
    pub duration: Duration,

    /// Backend calls across all stages
    pub attempts: u32,

    pub outputs: Vec<StageOutput>,
}

impl JobReport {
    /// Report for a job that never reached a worker
    #[must_use]
    pub fn cancelled_in_queue(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            state: JobState::Cancelled,
            cost: job.cost.total(),
            error: Some(DispatchError::Cancelled),
            duration: Duration::ZERO,
            attempts: 0,
            outputs: Vec::new(),
        }
    }
}

fn error_text<S: Serializer>(error: &Option<DispatchError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => s.serialize_str(&err.to_string()),
        None => s.serialize_none(),
    }
}

fn duration_secs<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(duration.as_secs_f64())
}

// ============================================================================
// Worker Context
// ============================================================================

/// State shared by every worker
pub struct WorkerContext {
    pub queue: Arc<AdmissionQueue>,
    pub router: Arc<ModelRouter>,
    pub pool: ResourcePool<ExecutionContext>,
    pub registry: Arc<JobRegistry>,
    pub metrics: Arc<DispatchMetrics>,
    pub estimator: Arc<DurationEstimator>,
    pub job_budget: Duration,
    pub reports: mpsc::UnboundedSender<JobReport>,
    running: AtomicUsize,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<AdmissionQueue>,
        router: Arc<ModelRouter>,
        pool: ResourcePool<ExecutionContext>,
        registry: Arc<JobRegistry>,
        metrics: Arc<DispatchMetrics>,
        estimator: Arc<DurationEstimator>,
        job_budget: Duration,
        reports: mpsc::UnboundedSender<JobReport>,
    ) -> Self {
        Self {
            queue,
            router,
            pool,
            registry,
            metrics,
            estimator,
            job_budget,
            reports,
            running: AtomicUsize::new(0),
        }
    }

    /// Jobs currently executing on a worker
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Run a dequeued job to its terminal state
    ///
    /// Returns `None` when the job's record was already terminal.
    pub async fn process(&self, mut job: Job) -> Option<JobReport> {
        if job.cancel.is_cancelled() {
            tracing::info!(job_id = %job.id, "Job cancelled before start");
            return self.conclude(&job, Err(DispatchError::Cancelled), Duration::ZERO);
        }

        let _running = RunningGuard::enter(&self.running);
        self.registry.mark_running(&job.id);
        job.started_at = Some(Utc::now());
        let started = Instant::now();

        tracing::info!(
            job_id = %job.id,
            task_kind = %job.task_kind,
            complexity = %job.complexity,
            stages = job.stages.len(),
            "Job started"
        );

        let result = match tokio::time::timeout(self.job_budget, self.execute_stages(&mut job)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    job_id = %job.id,
                    budget_secs = self.job_budget.as_secs(),
                    stage = job.current_stage,
                    "Job exceeded its budget"
                );
                Err(DispatchError::Timeout {
                    budget: self.job_budget,
                })
            }
        };

        let elapsed = started.elapsed();
        self.estimator.record(elapsed);
        job.completed_at = Some(Utc::now());
        self.conclude(&job, result, elapsed)
    }

    async fn execute_stages(&self, job: &mut Job) -> Result<(), DispatchError> {
        let ladder = self.router.resolve(job.task_kind, job.complexity)?;

        while job.current_stage < job.stages.len() {
            if job.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let index = job.current_stage;
            let stage = &job.stages[index];

            let mut lease = if stage.requires_resource() {
                Some(self.pool.acquire(&job.id).await?)
            } else {
                None
            };
            if let Some(lease) = lease.as_mut() {
                lease.uses += 1;
            }

            let (result, attempts) = {
                let mut call = CallContext {
                    job_id: &job.id,
                    stage_index: index,
                    stage,
                    cost: &job.cost,
                    cancel: &job.cancel,
                    resource: lease.as_ref().map(|l| l.label.clone()),
                    attempts: 0,
                };
                let result = self.router.invoke(&mut call, ladder).await;
                (result, call.attempts)
            };
            drop(lease);

            job.attempts[index] += attempts;
            let invocation = result?;

            tracing::info!(
                job_id = %job.id,
                stage = %stage.kind,
                backend = %invocation.backend_id,
                escalations = invocation.escalations(),
                cost = invocation.cost,
                "Stage completed"
            );

            job.outputs.push(StageOutput {
                stage: stage.kind,
                backend_id: invocation.backend_id.clone(),
                escalations: invocation.escalations(),
                content: invocation.content,
            });
            job.current_stage += 1;
            self.registry.mark_stage_done(&job.id, job.current_stage);
        }

        if job.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }

    fn conclude(
        &self,
        job: &Job,
        result: Result<(), DispatchError>,
        duration: Duration,
    ) -> Option<JobReport> {
        let (state, error) = match result {
            Ok(()) => (JobState::Succeeded, None),
            Err(DispatchError::Cancelled) => (JobState::Cancelled, Some(DispatchError::Cancelled)),
            Err(err) => (JobState::Failed, Some(err)),
        };

        if !self.registry.finish(&job.id, state, error.clone()) {
            tracing::debug!(job_id = %job.id, "Job already reached a terminal state");
            return None;
        }

        match (&state, &error) {
            (JobState::Succeeded, _) => self.metrics.record_succeeded(),
            (JobState::Cancelled, _) => self.metrics.record_cancelled(),
            (_, err) => self
                .metrics
                .record_failed(matches!(err, Some(DispatchError::Timeout { .. }))),
        }

        let cost = job.cost.total();
        match &error {
            None => tracing::info!(job_id = %job.id, cost, duration_ms = duration.as_millis() as u64, "Job succeeded"),
            Some(err) => tracing::info!(
                job_id = %job.id,
                state = %state,
                error = %err,
                cost,
                "Job finished without success"
            ),
        }

        Some(JobReport {
            job_id: job.id.clone(),
            state,
            cost,
            error,
            duration,
            attempts: job.total_attempts(),
            outputs: job.outputs.clone(),
        })
    }
}

/// Keeps the running counter accurate even if a job future is dropped
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Fixed-size set of worker tasks
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers; they exit once the queue is closed and drained
    pub fn spawn(size: usize, context: Arc<WorkerContext>) -> Self {
        let handles = (0..size)
            .map(|index| {
                let context = Arc::clone(&context);
                tokio::spawn(run_worker(index, context))
            })
            .collect();
        tracing::info!(workers = size, "Worker pool started");
        Self { handles }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

async fn run_worker(index: usize, context: Arc<WorkerContext>) {
    tracing::debug!(worker = index, "Worker waiting for jobs");
    while let Some(job) = context.queue.dequeue().await {
        if let Some(report) = context.process(job).await {
            if context.reports.send(report).is_err() {
                tracing::debug!(worker = index, "Report receiver dropped");
            }
        }
    }
    tracing::debug!(worker = index, "Worker exiting");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, DispatchConfig};
    use crate::job::{Complexity, JobSpec, Stage, StageKind, TaskKind};
    use crate::registry::JobRecord;
    use crate::routing::test_utils::{ScriptedAdapter, Step};
    use crate::routing::{AdapterSet, BackendAdapter, BreakerConfig, RateLimitConfig};

    use pretty_assertions::assert_eq;

    struct Fixture {
        context: Arc<WorkerContext>,
        adapter: Arc<ScriptedAdapter>,
        reports: mpsc::UnboundedReceiver<JobReport>,
    }

    fn fixture(budget: Duration) -> Fixture {
        let config = DispatchConfig::new(1, 4, 1, budget)
            .with_backend(BackendConfig::new(
                "b1",
                "test",
                2,
                1.0,
                RateLimitConfig::new(100, Duration::from_secs(1)),
                BreakerConfig::new(3, Duration::from_secs(30)),
            ))
            .with_ladder(TaskKind::CodeGeneration, Complexity::Simple, &["b1"]);

        let adapter = Arc::new(ScriptedAdapter::new());
        let adapters: AdapterSet = [(
            "b1".to_string(),
            Arc::clone(&adapter) as Arc<dyn BackendAdapter>,
        )]
        .into_iter()
        .collect();

        let metrics = Arc::new(DispatchMetrics::new());
        let estimator = Arc::new(DurationEstimator::new());
        let router = ModelRouter::from_config(&config, adapters, Arc::clone(&metrics)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let context = WorkerContext::new(
            Arc::new(AdmissionQueue::new(4, 1, Arc::clone(&estimator))),
            Arc::new(router),
            ResourcePool::with_factory(1, ExecutionContext::new),
            Arc::new(JobRegistry::new()),
            metrics,
            estimator,
            budget,
            tx,
        );

        Fixture {
            context: Arc::new(context),
            adapter,
            reports: rx,
        }
    }

    fn job(context: &WorkerContext, stages: Vec<Stage>) -> Job {
        let job = Job::from_spec(
            JobId::generate(),
            JobSpec::new(TaskKind::CodeGeneration, Complexity::Simple, stages),
        );
        context
            .registry
            .insert(job.id.clone(), JobRecord::queued(&job));
        job
    }

    #[tokio::test]
    async fn test_runs_every_stage() {
        let fx = fixture(Duration::from_secs(60));
        fx.adapter.set_default("b1", Step::ok("done", 4));

        let job = job(
            &fx.context,
            vec![
                Stage::new(StageKind::Requirements),
                Stage::new(StageKind::BrowserTest),
            ],
        );
        let id = job.id.clone();
        let report = fx.context.process(job).await.unwrap();

        assert_eq!(report.state, JobState::Succeeded);
        assert_eq!(report.outputs.len(), 2);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.cost, 8.0);
        assert_eq!(fx.context.registry.get(&id).unwrap().stages_done, 2);
        assert_eq!(fx.context.running(), 0);
        assert_eq!(fx.context.estimator.samples(), 1);

        let calls = fx.adapter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(fx.context.pool.stats().total_leases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded_releases_lease() {
        let fx = fixture(Duration::from_secs(10));
        fx.adapter.script(
            "b1",
            [Step::Delay {
                delay: Duration::from_secs(60),
                units: 1,
            }],
        );

        let job = job(&fx.context, vec![Stage::new(StageKind::Deploy)]);
        let report = fx.context.process(job).await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(
            report.error,
            Some(DispatchError::Timeout {
                budget: Duration::from_secs(10)
            })
        );
        assert_eq!(fx.context.pool.stats().idle, 1);
        assert_eq!(fx.context.metrics.snapshot().timed_out, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_calls_backend() {
        let fx = fixture(Duration::from_secs(60));
        let job = job(&fx.context, vec![Stage::new(StageKind::Requirements)]);
        job.cancel.cancel();

        let report = fx.context.process(job).await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(fx.adapter.calls().len(), 0);
        assert_eq!(fx.context.estimator.samples(), 0);
    }

    #[tokio::test]
    async fn test_failed_stage_stops_job() {
        let fx = fixture(Duration::from_secs(60));
        fx.adapter.script("b1", [Step::ok("first", 1), Step::Fail]);

        let job = job(
            &fx.context,
            vec![
                Stage::new(StageKind::Requirements),
                Stage::new(StageKind::CodeGeneration),
                Stage::new(StageKind::CodeReview),
            ],
        );
        let report = fx.context.process(job).await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.outputs.len(), 1);
        assert!(matches!(
            report.error,
            Some(DispatchError::NoCapacityAvailable { attempted: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_exits() {
        let mut fx = fixture(Duration::from_secs(60));
        fx.adapter.set_default("b1", Step::ok("ok", 1));

        for _ in 0..3 {
            let job = job(&fx.context, vec![Stage::new(StageKind::Requirements)]);
            fx.context.queue.enqueue(job).unwrap();
        }
        fx.context.queue.close();

        let pool = WorkerPool::spawn(2, Arc::clone(&fx.context));
        assert_eq!(pool.size(), 2);
        pool.join().await;

        let mut finished = 0;
        while let Ok(report) = fx.reports.try_recv() {
            assert_eq!(report.state, JobState::Succeeded);
            finished += 1;
        }
        assert_eq!(finished, 3);
    }

    #[test]
    fn test_report_serializes_error_text() {
        let job = Job::from_spec(
            JobId::new("q"),
            JobSpec::new(TaskKind::Chat, Complexity::Simple, vec![]),
        );
        let json = serde_json::to_value(JobReport::cancelled_in_queue(&job)).unwrap();
        assert_eq!(json["state"], "cancelled");
        assert_eq!(json["error"], "job was cancelled");
        assert_eq!(json["duration"], 0.0);
    }
}
