//! Dispatch Metrics
//!
//! Lock-free counters for admission, job outcomes and backend traffic, plus
//! the moving average of job duration that drives queue ETAs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// Counters
// ============================================================================

/// Process-wide dispatch counters, owned by the dispatcher
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    backend_calls: AtomicU64,
    escalations: AtomicU64,
    capacity_signals: AtomicU64,
    backend_failures: AtomicU64,
    circuit_rejections: AtomicU64,
    cache_hits: AtomicU64,
}

impl DispatchMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed job; `timed_out` also bumps the timeout counter
    pub fn record_failed(&self, timed_out: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_call(&self) {
        self.backend_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_signal(&self) {
        self.capacity_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// A stage call served from the response cache
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            capacity_signals: self.capacity_signals.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`DispatchMetrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub backend_calls: u64,
    pub escalations: u64,
    pub capacity_signals: u64,
    pub backend_failures: u64,
    pub circuit_rejections: u64,
    pub cache_hits: u64,
}

impl MetricsSnapshot {
    /// Jobs that reached a terminal state
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }
}

// ============================================================================
// Job Duration Estimator
// ============================================================================

/// Exponential moving average of job wall-clock duration
///
/// Empty until the first job finishes; no duration is assumed before that.
#[derive(Debug, Default)]
pub struct DurationEstimator {
    average_secs: Mutex<Option<f64>>,
    samples: AtomicU64,
}

impl DurationEstimator {
    /// Weight of the newest sample
    const ALPHA: f64 = 0.3;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, duration: Duration) {
        let sample = duration.as_secs_f64();
        let mut average = self.average_secs.lock();
        *average = Some(match *average {
            Some(avg) => Self::ALPHA * sample + (1.0 - Self::ALPHA) * avg,
            None => sample,
        });
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn average(&self) -> Option<Duration> {
        self.average_secs
            .lock()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}
