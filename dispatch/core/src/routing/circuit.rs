//! Circuit Breaker
//!
//! Per-backend failure isolation. Only `failure` outcomes count; capacity
//! signals are normal escalation traffic and never trip a breaker.
//!
//! # State Machine
//!
//! ```text
//! +--------+  threshold failures  +------+     cooldown elapsed     +-----------+
//! | Closed | -------------------> | Open | -----------------------> | Half-Open |
//! +--------+                      +------+                          +-----------+
//!     ^                              ^           trial failure            |
//!     |                              +------------------------------------+
//!     |                  trial success                                    |
//!     +-------------------------------------------------------------------+
//! ```
//!
//! - **Closed**: calls allowed, consecutive failures counted
//! - **Open**: calls rejected without reaching the adapter
//! - **Half-Open**: exactly one trial call admitted at a time
//!
//! Every admitted call carries a [`CallPermit`]. Only the trial permit moves
//! a half-open circuit, and an abandoned trial permit frees its slot on drop.
//!
//! The Open to Half-Open transition is evaluated lazily whenever the breaker
//! is consulted, so no timer task is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ============================================================================
// Circuit State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds for one backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before a trial call is allowed
    pub cooldown: Duration,
}

impl BreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
        }
    }
}

/// How a call was let through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, call normally
    Allowed,
    /// Half-open circuit, this caller holds the single trial slot
    Trial,
}

/// Outcome reported back to the breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Capacity,
}

/// Permission for one call, settled with the call's outcome
///
/// Dropping an unsettled trial permit gives the trial slot back, so a call
/// abandoned mid-flight (job budget expired, worker shut down) never leaves
/// the breaker half-open with the slot taken.
#[must_use = "settle the permit with the outcome of the call"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallPermit<'_> {
    #[must_use]
    pub fn admission(&self) -> Admission {
        self.admission
    }

    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }

    pub fn success(self) {
        self.settle(Outcome::Success);
    }

    pub fn failure(self) {
        self.settle(Outcome::Failure);
    }

    /// Capacity signal: frees a held trial slot, never changes state or
    /// the failure count
    pub fn capacity(self) {
        self.settle(Outcome::Capacity);
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.settle(self.admission, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            tracing::debug!(backend = %self.breaker.backend_id, "Trial call abandoned, releasing slot");
            self.breaker.release_trial();
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u64,

    /// Time since the circuit last opened, if it ever did
    #[serde(skip)]
    pub since_opened: Option<Duration>,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Breaker for a single backend
///
/// All transitions happen under one short critical section.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            trips: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state, applying a due Open to Half-Open transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: self.trips.load(Ordering::Relaxed),
            since_opened: inner.opened_at.map(|at| at.elapsed()),
        }
    }

    /// Decide whether a call may proceed, reserving the trial slot when
    /// the circuit is half-open. `None` means the call must be skipped.
    pub fn try_admit(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let admission = match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if inner.trial_in_flight => return None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Admission::Trial
            }
        };
        Some(CallPermit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    /// Success of a call admitted while the circuit was closed
    pub fn record_success(&self) {
        self.settle(Admission::Allowed, Outcome::Success);
    }

    /// Failure of a call admitted while the circuit was closed
    pub fn record_failure(&self) {
        self.settle(Admission::Allowed, Outcome::Failure);
    }

    /// Capacity signal of a call admitted while the circuit was closed
    pub fn record_capacity(&self) {
        self.settle(Admission::Allowed, Outcome::Capacity);
    }

    fn settle(&self, admission: Admission, outcome: Outcome) {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => match outcome {
                Outcome::Success => self.transition_to_closed(&mut inner),
                Outcome::Failure => {
                    inner.consecutive_failures += 1;
                    self.transition_to_open(&mut inner);
                }
                Outcome::Capacity => inner.trial_in_flight = false,
            },
            (CircuitState::Closed, _) => match outcome {
                Outcome::Success => inner.consecutive_failures = 0,
                Outcome::Failure => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.transition_to_open(&mut inner);
                    }
                }
                Outcome::Capacity => {}
            },
            // Late results from calls admitted under an earlier state; only
            // the trial decides how a half-open circuit moves on
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if opened_at.elapsed() >= self.config.cooldown {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!(backend = %self.backend_id, "Circuit breaker transitioning to half-open");
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        self.trips.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            backend = %self.backend_id,
            consecutive_failures = inner.consecutive_failures,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;

        tracing::info!(backend = %self.backend_id, "Circuit breaker closed - backend recovered");
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Breakers for every configured backend
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl CircuitRegistry {
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = (&'a str, BreakerConfig)>) -> Self {
        let breakers = configs
            .into_iter()
            .map(|(id, config)| (id.to_string(), CircuitBreaker::new(id, config)))
            .collect();
        Self { breakers }
    }

    #[must_use]
    pub fn get(&self, backend_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(backend_id)
    }

    /// Snapshots of all breakers, sorted by backend id
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.breakers
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================
