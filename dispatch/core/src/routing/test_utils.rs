//! Scripted Adapter for Router Tests
//!
//! Plays back a per-backend script of responses and records every call, so
//! tests can assert which backends were reached and in what order.
//!
//! ```ignore
//! let adapter = ScriptedAdapter::new();
//! adapter.script("b1", [Step::Capacity { units: 0 }]);
//! adapter.set_default("b2", Step::ok("done", 10));
//! // ... run the router ...
//! assert_eq!(adapter.call_count("b1"), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{AdapterError, AdapterRequest, AdapterResponse, BackendAdapter};

/// One scripted reply
#[derive(Clone, Debug)]
pub enum Step {
    Ok { content: String, units: u64 },
    Capacity { units: u64 },
    Fail,
    Transport,
    /// Wait, then succeed
    Delay { delay: Duration, units: u64 },
}

impl Step {
    pub fn ok(content: &str, units: u64) -> Self {
        Self::Ok {
            content: content.to_string(),
            units,
        }
    }
}

/// Record of a call that reached the adapter
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub backend_id: String,
    pub job_id: String,
    pub attempt: u32,
}

#[derive(Default)]
pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    defaults: Mutex<HashMap<String, Step>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for a backend, consumed in order
    pub fn script(&self, backend_id: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .entry(backend_id.to_string())
            .or_default()
            .extend(steps);
    }

    /// Reply used once a backend's script runs out
    pub fn set_default(&self, backend_id: &str, step: Step) {
        self.defaults.lock().insert(backend_id.to_string(), step);
    }

    pub fn call_count(&self, backend_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.backend_id == backend_id)
            .count()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn next_step(&self, backend_id: &str) -> Step {
        if let Some(step) = self
            .scripts
            .lock()
            .get_mut(backend_id)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        self.defaults
            .lock()
            .get(backend_id)
            .cloned()
            .unwrap_or(Step::Fail)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<AdapterResponse, AdapterError> {
        self.calls.lock().push(RecordedCall {
            backend_id: request.backend_id.clone(),
            job_id: request.job_id.to_string(),
            attempt: request.attempt,
        });

        match self.next_step(&request.backend_id) {
            Step::Ok { content, units } => Ok(AdapterResponse::success(content, units)),
            Step::Capacity { units } => Ok(AdapterResponse::capacity(units)),
            Step::Fail => Ok(AdapterResponse::failure(0)),
            Step::Transport => Err(AdapterError::Transport("connection reset".to_string())),
            Step::Delay { delay, units } => {
                tokio::time::sleep(delay).await;
                Ok(AdapterResponse::success("late", units))
            }
        }
    }
}
