//! Job Registry
//!
//! Per-job records readable without touching the job itself: state, cost
//! ledger, cancellation flag, error, timestamps. The worker that owns a job
//! writes its record; `status` and `cancel` only read it or raise the flag.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::DispatchError;
use crate::job::{CancelFlag, CostLedger, Job, JobId, JobState};

/// Observable record of one job
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub state: JobState,
    pub cost: Arc<CostLedger>,
    pub cancel: CancelFlag,
    pub error: Option<DispatchError>,

    /// Stages completed so far
    pub stages_done: usize,
    pub stage_count: usize,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Record for a freshly submitted job, sharing its ledger and flag
    #[must_use]
    pub fn queued(job: &Job) -> Self {
        Self {
            state: JobState::Queued,
            cost: Arc::clone(&job.cost),
            cancel: job.cancel.clone(),
            error: None,
            stages_done: 0,
            stage_count: job.stages.len(),
            created_at: job.created_at,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Concurrent map of job records
#[derive(Debug, Default)]
pub struct JobRegistry {
    records: DashMap<JobId, JobRecord>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: JobId, record: JobRecord) {
        self.records.insert(id, record);
    }

    /// Insert a record unless the id belongs to an active job
    ///
    /// Fails with the active job's state when the id is taken. A terminal
    /// record under the same id is replaced and handed back, so finished ids
    /// can be reused and a rejected reuse can put the old record back.
    pub fn admit(&self, id: JobId, record: JobRecord) -> Result<Option<JobRecord>, JobState> {
        match self.records.entry(id) {
            Entry::Occupied(mut existing) => {
                if existing.get().state.is_active() {
                    return Err(existing.get().state);
                }
                Ok(Some(existing.insert(record)))
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(None)
            }
        }
    }

    /// Undo an `admit` whose job never made it into the queue
    pub fn revert_admit(&self, id: &JobId, replaced: Option<JobRecord>) {
        match replaced {
            Some(previous) => {
                self.records.insert(id.clone(), previous);
            }
            None => {
                self.records.remove(id);
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    #[must_use]
    pub fn state(&self, id: &JobId) -> Option<JobState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn mark_running(&self, id: &JobId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
        }
    }

    pub fn mark_stage_done(&self, id: &JobId, stages_done: usize) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.stages_done = stages_done;
        }
    }

    /// Move a job to its terminal state
    ///
    /// A record that is already terminal keeps its first outcome, so every
    /// job reports exactly one terminal state.
    pub fn finish(&self, id: &JobId, state: JobState, error: Option<DispatchError>) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        record.state = state;
        record.error = error;
        record.completed_at = Some(Utc::now());
        true
    }

    /// Raise the cancellation flag of an active job
    ///
    /// Returns the state observed at the time, or `None` for unknown jobs.
    pub fn request_cancel(&self, id: &JobId) -> Option<JobState> {
        let record = self.records.get(id)?;
        if record.state.is_active() {
            record.cancel.cancel();
        }
        Some(record.state)
    }

    /// Drop terminal records completed before `cutoff`
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.state.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff))
        });
        before - self.records.len()
    }

    #[must_use]
    pub fn count_in(&self, state: JobState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
