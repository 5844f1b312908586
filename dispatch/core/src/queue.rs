//! Admission Queue
//!
//! Bounded FIFO intake between `submit` and the worker pool.
//!
//! - `enqueue` rejects with `QueueFull` once the configured maximum is reached
//! - `dequeue` suspends until an entry exists and hands out entries strictly
//!   in enqueue order, each exactly once
//! - `cancel` removes an entry that has not been dequeued yet
//!
//! Positions are 1-based. The ETA for position `p` is
//! `floor((p - 1) / workers) × average job duration`, evaluated against live
//! data every time it is asked for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::DispatchError;
use crate::job::{Job, JobId};
use crate::metrics::DurationEstimator;

/// A queued job and when it arrived
#[derive(Debug)]
pub struct QueueEntry {
    pub job: Job,
    pub enqueued_at: Instant,
}

/// Where a job sits and roughly when it will start
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueueTicket {
    /// 1-based position; 1 means next to be dequeued
    pub position: usize,

    /// `None` until at least one job has finished
    #[serde(with = "optional_secs")]
    pub eta: Option<Duration>,
}

/// Bounded FIFO queue of jobs awaiting a worker
pub struct AdmissionQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    max_size: usize,
    workers: usize,
    closed: AtomicBool,
    estimator: Arc<DurationEstimator>,
}

impl AdmissionQueue {
    /// `workers` is the worker pool size used for ETA estimates
    pub fn new(max_size: usize, workers: usize, estimator: Arc<DurationEstimator>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size)),
            notify: Notify::new(),
            max_size,
            workers: workers.max(1),
            closed: AtomicBool::new(false),
            estimator,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Append a job, or reject it when the queue is full or closed
    pub fn enqueue(&self, job: Job) -> Result<QueueTicket, DispatchError> {
        let position = {
            let mut entries = self.entries.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(DispatchError::ShuttingDown);
            }
            if entries.len() >= self.max_size {
                return Err(DispatchError::QueueFull { max: self.max_size });
            }
            entries.push_back(QueueEntry {
                job,
                enqueued_at: Instant::now(),
            });
            entries.len()
        };

        self.notify.notify_one();
        Ok(QueueTicket {
            position,
            eta: self.eta_for(position),
        })
    }

    /// Take the oldest entry, waiting while the queue is empty
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close between the check and the
            // await still wakes us
            notified.as_mut().enable();

            {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.pop_front() {
                    let waited = entry.enqueued_at.elapsed();
                    drop(entries);
                    tracing::debug!(
                        job_id = %entry.job.id,
                        waited_ms = waited.as_millis() as u64,
                        "Job dequeued"
                    );
                    return Some(entry.job);
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Remove a queued job; `None` if it is not in the queue
    pub fn cancel(&self, job_id: &JobId) -> Option<Job> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| &e.job.id == job_id)?;
        entries.remove(index).map(|entry| entry.job)
    }

    /// 1-based position of a queued job
    #[must_use]
    pub fn position(&self, job_id: &JobId) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| &e.job.id == job_id)
            .map(|index| index + 1)
    }

    /// Current ticket for a queued job
    #[must_use]
    pub fn ticket(&self, job_id: &JobId) -> Option<QueueTicket> {
        let position = self.position(job_id)?;
        Some(QueueTicket {
            position,
            eta: self.eta_for(position),
        })
    }

    /// Estimated wait before the job at `position` starts
    #[must_use]
    pub fn eta_for(&self, position: usize) -> Option<Duration> {
        let average = self.estimator.average()?;
        let rounds = position.saturating_sub(1) / self.workers;
        Some(average.mul_f64(rounds as f64))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    /// Queued job ids in dequeue order
    #[must_use]
    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries.lock().iter().map(|e| e.job.id.clone()).collect()
    }

    /// Stop accepting jobs; waiting dequeuers drain what is left, then see
    /// `None`
    pub fn close(&self) {
        {
            let _entries = self.entries.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
