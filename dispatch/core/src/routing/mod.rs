//! Backend Routing
//!
//! Everything between a stage and an external backend:
//!
//! - [`backend`]: backend descriptors, cost model, adapter trait
//! - [`cache`]: short-lived cache of served stage responses
//! - [`ladder`]: escalation ladders keyed by (task kind, complexity)
//! - [`rate_limit`]: per-backend sliding-window admission
//! - [`circuit`]: per-backend circuit breakers
//! - [`router`]: ladder walking, classification and cost accounting

pub mod backend;
pub mod cache;
pub mod circuit;
pub mod ladder;
pub mod rate_limit;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use backend::{
    AdapterError, AdapterRequest, AdapterResponse, AdapterSet, Backend, BackendAdapter,
    Classification, CostModel,
};
pub use cache::{CacheConfig, CacheKey, CachedResponse, ResponseCache};
pub use circuit::{
    Admission, BreakerConfig, CallPermit, CircuitBreaker, CircuitRegistry, CircuitSnapshot,
    CircuitState,
};
pub use ladder::{EscalationLadder, LadderError, LadderTable};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimiter, RateWindow};
pub use router::{CallContext, Invocation, ModelRouter};
