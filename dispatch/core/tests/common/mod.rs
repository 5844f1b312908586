//! Shared fixtures for dispatch integration tests
//!
//! `MockAdapter` answers per backend from a script, records every call with
//! the (possibly paused) tokio clock, and tracks how many calls overlap.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use dispatch_core::{
    AdapterError, AdapterRequest, AdapterResponse, AdapterSet, BackendAdapter, BackendConfig,
    BreakerConfig, Complexity, DispatchConfig, Dispatcher, JobReport, JobSpec, RateLimitConfig,
    Stage, StageKind, TaskKind,
};

/// Scripted reply for one call
#[derive(Clone, Debug)]
pub enum Reply {
    Ok { content: String, units: u64 },
    Capacity { units: u64 },
    Fail,
    Transport,
    /// Sleep, then succeed
    Slow { delay: Duration, units: u64 },
}

impl Reply {
    pub fn ok(content: &str, units: u64) -> Self {
        Self::Ok {
            content: content.to_string(),
            units,
        }
    }

    pub fn slow(secs: u64) -> Self {
        Self::Slow {
            delay: Duration::from_secs(secs),
            units: 1,
        }
    }
}

/// A call as the adapter saw it
#[derive(Clone, Debug)]
pub struct SeenCall {
    pub backend_id: String,
    pub job_id: String,
    pub stage_index: usize,
    pub resource: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockAdapter {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<SeenCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, backend_id: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .entry(backend_id.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_default(&self, backend_id: &str, reply: Reply) {
        self.defaults.lock().insert(backend_id.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<SeenCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, backend_id: &str) -> Vec<SeenCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.backend_id == backend_id)
            .cloned()
            .collect()
    }

    pub fn calls_for_job(&self, job_id: &str) -> Vec<SeenCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Most calls ever in progress at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, backend_id: &str) -> Reply {
        if let Some(reply) = self
            .scripts
            .lock()
            .get_mut(backend_id)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.defaults
            .lock()
            .get(backend_id)
            .cloned()
            .unwrap_or(Reply::Fail)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<AdapterResponse, AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.calls.lock().push(SeenCall {
            backend_id: request.backend_id.clone(),
            job_id: request.job_id.to_string(),
            stage_index: request.stage_index,
            resource: request.resource.clone(),
            at: Instant::now(),
        });

        match self.next_reply(&request.backend_id) {
            Reply::Ok { content, units } => Ok(AdapterResponse::success(content, units)),
            Reply::Capacity { units } => Ok(AdapterResponse::capacity(units)),
            Reply::Fail => Ok(AdapterResponse::failure(0)),
            Reply::Transport => Err(AdapterError::Transport("connection refused".to_string())),
            Reply::Slow { delay, units } => {
                tokio::time::sleep(delay).await;
                Ok(AdapterResponse::success("slow", units))
            }
        }
    }
}

// ============================================================================
// Config helpers
// ============================================================================

/// Backend with a roomy rate limit and the given breaker threshold
pub fn backend(id: &str, tier: u32, unit_price: f64, threshold: u32) -> BackendConfig {
    BackendConfig::new(
        id,
        "mock",
        tier,
        unit_price,
        RateLimitConfig::new(1_000, Duration::from_secs(1)),
        BreakerConfig::new(threshold, Duration::from_secs(30)),
    )
}

pub fn config(workers: usize, queue_max: usize, resources: usize, budget_secs: u64) -> DispatchConfig {
    DispatchConfig::new(
        workers,
        queue_max,
        resources,
        Duration::from_secs(budget_secs),
    )
}

/// Route every configured backend to the same mock
pub fn adapters(adapter: &Arc<MockAdapter>, config: &DispatchConfig) -> AdapterSet {
    config
        .backends
        .iter()
        .map(|b| (b.id.clone(), Arc::clone(adapter) as Arc<dyn BackendAdapter>))
        .collect()
}

pub fn dispatcher(config: DispatchConfig, adapter: &Arc<MockAdapter>) -> Arc<Dispatcher> {
    let adapters = adapters(adapter, &config);
    Arc::new(Dispatcher::new(config, adapters).unwrap())
}

/// Single-stage code generation job
pub fn simple_job() -> JobSpec {
    job(&[StageKind::Requirements])
}

pub fn job(stages: &[StageKind]) -> JobSpec {
    JobSpec::new(
        TaskKind::CodeGeneration,
        Complexity::Simple,
        stages.iter().map(|k| Stage::new(*k)).collect(),
    )
}

/// Wait for `count` reports
pub async fn collect(reports: &mut mpsc::UnboundedReceiver<JobReport>, count: usize) -> Vec<JobReport> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        match reports.recv().await {
            Some(report) => out.push(report),
            None => break,
        }
    }
    out
}
