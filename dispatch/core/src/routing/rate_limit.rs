//! Per-Backend Sliding-Window Rate Limiting
//!
//! Each backend keeps the timestamps of calls admitted during the last
//! `window`. A caller that finds the window full waits until the oldest
//! timestamp ages out, then re-checks.
//!
//! # Design
//!
//! ```text
//!  window = 10s, limit = 2
//!
//!  t=0  acquire ──> [0]        admitted
//!  t=0  acquire ──> [0, 0]     admitted
//!  t=0  acquire ──> full, wait until 0 + 10s
//!  t=10           [10]         admitted
//! ```
//!
//! All acquirers of one backend hold that backend's async mutex for the
//! whole check-and-wait, so two callers can never both see "one slot left"
//! and waiting callers are admitted in arrival order. Time comes from
//! `tokio::time`, so tests may run against a paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

// =============================================================================
// Configuration
// =============================================================================

/// Per-backend window configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum calls admitted inside any window
    pub limit: u32,

    /// Window length
    pub window: Duration,
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

// =============================================================================
// Error Types
// =============================================================================

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RateLimitError {
    /// No window registered for the backend
    #[error("no rate window registered for backend {0}")]
    UnknownBackend(String),
}

// =============================================================================
// Rate Window
// =============================================================================

/// Sliding window of admitted call timestamps for one backend
#[derive(Debug)]
pub struct RateWindow {
    config: RateLimitConfig,

    /// Admission timestamps, oldest first
    calls: Mutex<VecDeque<Instant>>,

    total_admitted: AtomicU64,
    total_delayed: AtomicU64,
}

impl RateWindow {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(VecDeque::with_capacity(config.limit as usize)),
            total_admitted: AtomicU64::new(0),
            total_delayed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait for a slot and record the admission
    ///
    /// Returns how long the caller was held back. The wait is bounded by
    /// the window length per retry.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let mut calls = self.calls.lock().await;
        let mut delayed = false;

        loop {
            let now = Instant::now();
            self.prune(&mut calls, now);

            if calls.len() < self.config.limit as usize {
                calls.push_back(now);
                self.total_admitted.fetch_add(1, Ordering::Relaxed);
                if delayed {
                    self.total_delayed.fetch_add(1, Ordering::Relaxed);
                }
                return now.duration_since(started);
            }

            // Full: the oldest admission is the first to leave the window
            let Some(&oldest) = calls.front() else {
                // limit == 0 is rejected at config load; admit rather than spin
                return now.duration_since(started);
            };
            delayed = true;
            tokio::time::sleep_until(oldest + self.config.window).await;
        }
    }

    /// Calls currently recorded inside the window
    pub async fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().await;
        self.prune(&mut calls, Instant::now());
        calls.len()
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = calls.front() {
            if now.duration_since(front) >= self.config.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    #[must_use]
    pub fn total_admitted(&self) -> u64 {
        self.total_admitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_delayed(&self) -> u64 {
        self.total_delayed.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Rate Limiter (all backends)
// =============================================================================

/// Registry of rate windows, fixed at construction
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, RateWindow>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(backend_id, config)` pairs
    pub fn from_configs<'a>(
        configs: impl IntoIterator<Item = (&'a str, RateLimitConfig)>,
    ) -> Self {
        let windows = configs
            .into_iter()
            .map(|(id, config)| (id.to_string(), RateWindow::new(config)))
            .collect();
        Self { windows }
    }

    /// Acquire a permit for a backend, suspending while its window is full
    pub async fn acquire(&self, backend_id: &str) -> Result<Duration, RateLimitError> {
        let window = self
            .windows
            .get(backend_id)
            .ok_or_else(|| RateLimitError::UnknownBackend(backend_id.to_string()))?;

        let waited = window.acquire().await;
        if !waited.is_zero() {
            tracing::debug!(
                backend = %backend_id,
                waited_ms = waited.as_millis() as u64,
                "Rate window full, call was delayed"
            );
        }
        Ok(waited)
    }

    #[must_use]
    pub fn window(&self, backend_id: &str) -> Option<&RateWindow> {
        self.windows.get(backend_id)
    }

    #[must_use]
    pub fn backend_count(&self) -> usize {
        self.windows.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::from_configs([(
            "b1",
            RateLimitConfig::new(limit, Duration::from_secs(window_secs)),
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_under_limit() {
        let limiter = limiter(3, 10);
        for _ in 0..3 {
            let waited = limiter.acquire("b1").await.unwrap();
            assert_eq!(waited, Duration::ZERO);
        }
        assert_eq!(limiter.window("b1").unwrap().in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_call_waits_full_window() {
        let limiter = limiter(2, 10);
        let start = Instant::now();

        limiter.acquire("b1").await.unwrap();
        limiter.acquire("b1").await.unwrap();
        limiter.acquire("b1").await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(limiter.window("b1").unwrap().total_delayed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(1, 5);
        limiter.acquire("b1").await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        let waited = limiter.acquire("b1").await.unwrap();
        assert_eq!(waited, Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(6)).await;
        let waited = limiter.acquire("b1").await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let limiter = limiter(1, 1);
        assert_eq!(
            limiter.acquire("nope").await,
            Err(RateLimitError::UnknownBackend("nope".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_never_overshoot() {
        let limiter = Arc::new(limiter(2, 10));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("b1").await.unwrap();
                Instant::now().duration_since(start)
            }));
        }

        let mut offsets = Vec::new();
        for handle in handles {
            offsets.push(handle.await.unwrap());
        }
        offsets.sort();

        assert_eq!(offsets[0], Duration::ZERO);
        assert_eq!(offsets[1], Duration::ZERO);
        assert_eq!(offsets[2], Duration::from_secs(10));
        assert_eq!(offsets[3], Duration::from_secs(10));
        assert_eq!(offsets[4], Duration::from_secs(20));
    }

    #[test]
    fn test_backend_count() {
        let limiter = RateLimiter::from_configs([
            ("a", RateLimitConfig::new(1, Duration::from_secs(1))),
            ("b", RateLimitConfig::new(2, Duration::from_secs(1))),
        ]);
        assert_eq!(limiter.backend_count(), 2);
        assert!(limiter.window("c").is_none());
    }
}
