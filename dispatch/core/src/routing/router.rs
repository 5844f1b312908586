//! Model Router
//!
//! Resolves a (task kind, complexity) pair to its escalation ladder and
//! drives one stage call down that ladder.
//!
//! # Per-entry flow
//!
//! ```text
//!  cached response for the same call ───────────────> return it, no charge
//!
//!  ladder entry
//!      │
//!      ├─ tier below stage requirement ──────────────> skip
//!      ├─ circuit open / trial taken ────────────────> skip
//!      ├─ cancelled? ────────────────────────────────> Cancelled
//!      ├─ rate window acquire (may wait)
//!      ├─ adapter call (bounded by call timeout)
//!      │     ├─ success + output ok ──> charge, close breaker, return
//!      │     ├─ success + malformed ──> charge, failure, retry once down the ladder
//!      │     ├─ capacity ─────────────> charge, next entry (breaker untouched)
//!      │     └─ failure / timeout / transport ──> charge, failure, next entry
//!      ▼
//!  ladder exhausted ──> NoCapacityAvailable
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::job::{CancelFlag, Complexity, CostLedger, JobId, Stage, TaskKind};
use crate::metrics::DispatchMetrics;

use super::backend::{
    AdapterError, AdapterRequest, AdapterResponse, AdapterSet, Backend, BackendAdapter,
    Classification,
};
use super::cache::{CacheConfig, CacheKey, CachedResponse, ResponseCache};
use super::circuit::{CallPermit, CircuitBreaker, CircuitRegistry, CircuitSnapshot};
use super::ladder::{EscalationLadder, LadderTable};
use super::rate_limit::RateLimiter;

// ============================================================================
// Call Context / Result
// ============================================================================

/// Everything the router needs to know about the job a call belongs to
#[derive(Debug)]
pub struct CallContext<'a> {
    pub job_id: &'a JobId,
    pub stage_index: usize,
    pub stage: &'a Stage,
    pub cost: &'a CostLedger,
    pub cancel: &'a CancelFlag,

    /// Label of the execution context leased for this stage
    pub resource: Option<String>,

    /// Adapter calls issued for this stage so far
    pub attempts: u32,
}

/// A successful stage call
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub content: String,
    pub backend_id: String,
    pub consumed_units: u64,
    pub cost: f64,

    /// Backends called for this stage, in order, including the one that
    /// served it
    pub tried: Vec<String>,

    /// Served from the response cache without a backend call
    pub cached: bool,
}

impl Invocation {
    /// Ladder entries called before the serving one
    #[must_use]
    pub fn escalations(&self) -> usize {
        self.tried.len().saturating_sub(1)
    }

    #[must_use]
    pub fn was_escalated(&self) -> bool {
        self.escalations() > 0
    }
}

/// What came back from one adapter call
enum CallOutcome {
    Response(AdapterResponse),
    TimedOut,
    Transport(AdapterError),
}

// ============================================================================
// Model Router
// ============================================================================

pub struct ModelRouter {
    backends: HashMap<String, Backend>,
    ladders: LadderTable,
    limiter: RateLimiter,
    breakers: CircuitRegistry,
    adapters: AdapterSet,
    metrics: Arc<DispatchMetrics>,
    cache: Option<ResponseCache>,
}

impl ModelRouter {
    /// Assemble a router; every backend needs a breaker, a rate window and
    /// an adapter
    pub fn new(
        backends: Vec<Backend>,
        ladders: LadderTable,
        limiter: RateLimiter,
        breakers: CircuitRegistry,
        adapters: AdapterSet,
        metrics: Arc<DispatchMetrics>,
    ) -> Result<Self, DispatchError> {
        for backend in &backends {
            if !adapters.contains_key(&backend.id) {
                return Err(DispatchError::Config(format!(
                    "no adapter registered for backend {}",
                    backend.id
                )));
            }
            if breakers.get(&backend.id).is_none() || limiter.window(&backend.id).is_none() {
                return Err(DispatchError::UnknownBackend(backend.id.clone()));
            }
        }

        let backends = backends.into_iter().map(|b| (b.id.clone(), b)).collect();
        Ok(Self {
            backends,
            ladders,
            limiter,
            breakers,
            adapters,
            metrics,
            cache: None,
        })
    }

    /// Serve repeated identical stage calls from memory
    #[must_use]
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(ResponseCache::new(config));
        self
    }

    /// Build every routing component from validated configuration
    pub fn from_config(
        config: &DispatchConfig,
        adapters: AdapterSet,
        metrics: Arc<DispatchMetrics>,
    ) -> Result<Self, DispatchError> {
        let ladders = config.ladder_table()?;
        let limiter = RateLimiter::from_configs(
            config.backends.iter().map(|b| (b.id.as_str(), b.rate_limit)),
        );
        let breakers =
            CircuitRegistry::from_configs(config.backends.iter().map(|b| (b.id.as_str(), b.breaker)));
        let backends = config.backends.iter().map(|b| b.descriptor()).collect();

        let router = Self::new(backends, ladders, limiter, breakers, adapters, metrics)?;
        Ok(match config.cache {
            Some(cache) => router.with_cache(cache),
            None => router,
        })
    }

    /// Configured ladder for the pair
    pub fn resolve(
        &self,
        task_kind: TaskKind,
        complexity: Complexity,
    ) -> Result<&EscalationLadder, DispatchError> {
        self.ladders
            .get(task_kind, complexity)
            .ok_or(DispatchError::UnknownTaskKind {
                task_kind,
                complexity,
            })
    }

    /// Run one stage call down the ladder
    pub async fn invoke(
        &self,
        ctx: &mut CallContext<'_>,
        ladder: &EscalationLadder,
    ) -> Result<Invocation, DispatchError> {
        let required_tier = ctx.stage.kind.required_tier();
        let mut tried: Vec<String> = Vec::new();
        let mut malformed = 0u32;

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| CacheKey::new(ladder.task_kind, ctx.stage));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if ctx.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if let Some(hit) = cache.get(key) {
                self.metrics.record_cache_hit();
                tracing::debug!(job_id = %ctx.job_id, backend = %hit.backend_id, "Stage call served from cache");
                return Ok(Invocation {
                    content: hit.content,
                    backend_id: hit.backend_id,
                    consumed_units: 0,
                    cost: 0.0,
                    tried,
                    cached: true,
                });
            }
        }

        for backend_id in ladder.iter() {
            let backend = self
                .backends
                .get(backend_id)
                .ok_or_else(|| DispatchError::UnknownBackend(backend_id.to_string()))?;
            let breaker = self
                .breakers
                .get(backend_id)
                .ok_or_else(|| DispatchError::UnknownBackend(backend_id.to_string()))?;

            if backend.tier < required_tier {
                tracing::debug!(
                    job_id = %ctx.job_id,
                    backend = %backend_id,
                    tier = backend.tier,
                    required_tier,
                    "Skipping backend below stage tier"
                );
                continue;
            }

            if ctx.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            // Dropping the permit on any early exit, including this future
            // being dropped, hands a half-open trial slot back
            let Some(permit) = breaker.try_admit() else {
                self.metrics.record_circuit_rejection();
                tracing::debug!(job_id = %ctx.job_id, backend = %backend_id, "Skipping backend with open circuit");
                continue;
            };

            if !tried.is_empty() {
                self.metrics.record_escalation();
            }
            tried.push(backend_id.to_string());

            // May suspend for up to one window
            self.limiter
                .acquire(backend_id)
                .await
                .map_err(|_| DispatchError::UnknownBackend(backend_id.to_string()))?;

            if ctx.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            ctx.attempts += 1;
            let outcome = self.call(ctx, backend).await;
            self.metrics.record_backend_call();

            let response = match outcome {
                CallOutcome::Response(response) => response,
                CallOutcome::TimedOut => {
                    tracing::warn!(job_id = %ctx.job_id, backend = %backend_id, "Backend call timed out");
                    self.note_failure(permit);
                    continue;
                }
                CallOutcome::Transport(err) => {
                    tracing::warn!(job_id = %ctx.job_id, backend = %backend_id, error = %err, "Backend transport error");
                    self.note_failure(permit);
                    continue;
                }
            };

            let cost = ctx
                .cost
                .charge(backend_id, response.consumed_units, backend.cost.unit_price);

            // The call ran to completion but nobody wants the result anymore
            if ctx.cancel.is_cancelled() {
                self.settle_discarded(permit, &response, ctx.stage);
                return Err(DispatchError::Cancelled);
            }

            match response.classification {
                Classification::Success => match ctx.stage.output_check.validate(&response.content) {
                    Ok(()) => {
                        permit.success();
                        tracing::debug!(
                            job_id = %ctx.job_id,
                            backend = %backend_id,
                            units = response.consumed_units,
                            cost,
                            "Stage call served"
                        );
                        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                            cache.insert(
                                key.clone(),
                                CachedResponse {
                                    content: response.content.clone(),
                                    backend_id: backend_id.to_string(),
                                },
                            );
                        }
                        return Ok(Invocation {
                            content: response.content,
                            backend_id: backend_id.to_string(),
                            consumed_units: response.consumed_units,
                            cost,
                            tried,
                            cached: false,
                        });
                    }
                    Err(reason) => {
                        self.note_failure(permit);
                        malformed += 1;
                        tracing::warn!(
                            job_id = %ctx.job_id,
                            backend = %backend_id,
                            reason = %reason,
                            malformed,
                            "Malformed stage output"
                        );
                        if malformed >= 2 {
                            return Err(DispatchError::MalformedOutput {
                                backend: backend_id.to_string(),
                                reason,
                            });
                        }
                    }
                },
                Classification::Capacity => {
                    permit.capacity();
                    self.metrics.record_capacity_signal();
                    tracing::debug!(job_id = %ctx.job_id, backend = %backend_id, "Backend at capacity, escalating");
                }
                Classification::Failure => {
                    tracing::warn!(job_id = %ctx.job_id, backend = %backend_id, "Backend reported failure");
                    self.note_failure(permit);
                }
            }
        }

        tracing::warn!(
            job_id = %ctx.job_id,
            task_kind = %ladder.task_kind,
            complexity = %ladder.complexity,
            attempted = tried.len(),
            "Escalation ladder exhausted"
        );
        Err(DispatchError::NoCapacityAvailable {
            attempted: tried.len(),
            ladder_len: ladder.depth(),
        })
    }

    async fn call(&self, ctx: &CallContext<'_>, backend: &Backend) -> CallOutcome {
        let Some(adapter) = self.adapters.get(&backend.id) else {
            return CallOutcome::Transport(AdapterError::Transport(format!(
                "no adapter for backend {}",
                backend.id
            )));
        };

        let request = AdapterRequest {
            job_id: ctx.job_id.clone(),
            backend_id: backend.id.clone(),
            stage: ctx.stage.kind,
            stage_index: ctx.stage_index,
            attempt: ctx.attempts,
            resource: ctx.resource.clone(),
            payload: ctx.stage.payload.clone(),
        };

        let result = match backend.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, adapter.invoke(request)).await {
                Ok(result) => result,
                Err(_) => return CallOutcome::TimedOut,
            },
            None => adapter.invoke(request).await,
        };

        match result {
            Ok(response) => CallOutcome::Response(response),
            Err(err) => CallOutcome::Transport(err),
        }
    }

    fn note_failure(&self, permit: CallPermit<'_>) {
        permit.failure();
        self.metrics.record_backend_failure();
    }

    /// Feed the breaker from a response whose job was cancelled meanwhile
    fn settle_discarded(&self, permit: CallPermit<'_>, response: &AdapterResponse, stage: &Stage) {
        match response.classification {
            Classification::Success if stage.output_check.validate(&response.content).is_ok() => {
                permit.success();
            }
            Classification::Capacity => permit.capacity(),
            _ => self.note_failure(permit),
        }
    }

    /// Response cache, when configured
    #[must_use]
    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn backend(&self, backend_id: &str) -> Option<&Backend> {
        self.backends.get(backend_id)
    }

    #[must_use]
    pub fn breaker(&self, backend_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(backend_id)
    }

    #[must_use]
    pub fn circuit_snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        self.breakers.snapshot_all()
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub fn ladders(&self) -> &LadderTable {
        &self.ladders
    }

    /// Adapter registered for a backend
    #[must_use]
    pub fn adapter(&self, backend_id: &str) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters.get(backend_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
