//! Job Types
//!
//! Data structures for pipeline jobs. The dispatcher owns job records; a
//! `Job` value itself moves from the admission queue to exactly one worker.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──> Queued ──> Running ──> Succeeded
//!              │           ├──────> Failed
//!              └───────────┴──────> Cancelled
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Job identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a job ID from a caller-chosen string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique job ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("job_{}", uuid::Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Task Kind / Complexity
// ============================================================================

/// Kind of work a job performs; selects the escalation ladder together
/// with [`Complexity`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Chat,
    Architecture,
    CodeGeneration,
    CodeReview,
    AdversarialLogic,
    AdversarialSecurity,
    AdversarialPerformance,
    BrowserTesting,
    BrandEvaluation,
    Deployment,
}

impl TaskKind {
    pub const ALL: [TaskKind; 10] = [
        Self::Chat,
        Self::Architecture,
        Self::CodeGeneration,
        Self::CodeReview,
        Self::AdversarialLogic,
        Self::AdversarialSecurity,
        Self::AdversarialPerformance,
        Self::BrowserTesting,
        Self::BrandEvaluation,
        Self::Deployment,
    ];

    /// Configuration name of this task kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Architecture => "architecture",
            Self::CodeGeneration => "code_generation",
            Self::CodeReview => "code_review",
            Self::AdversarialLogic => "adversarial_logic",
            Self::AdversarialSecurity => "adversarial_security",
            Self::AdversarialPerformance => "adversarial_performance",
            Self::BrowserTesting => "browser_testing",
            Self::BrandEvaluation => "brand_evaluation",
            Self::Deployment => "deployment",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Complexity tier of a job, cheapest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
    MostComplex,
}

impl Complexity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::MostComplex => "most_complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            "most_complex" => Ok(Self::MostComplex),
            other => Err(format!("unknown complexity: {other}")),
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Closed set of pipeline stage kinds
///
/// Each kind maps statically to the minimum backend capability tier it
/// needs and to whether it runs inside a pooled execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Requirements,
    Architecture,
    CodeGeneration,
    CodeReview,
    AdversarialReview,
    BrowserTest,
    BrandReview,
    Deploy,
}

impl StageKind {
    /// Minimum backend tier allowed to serve this stage
    #[must_use]
    pub fn required_tier(&self) -> u32 {
        match self {
            Self::Requirements | Self::BrowserTest | Self::BrandReview | Self::Deploy => 0,
            Self::CodeGeneration | Self::CodeReview | Self::AdversarialReview => 1,
            Self::Architecture => 2,
        }
    }

    /// Whether the stage leases a pooled execution context by default
    #[must_use]
    pub fn needs_resource(&self) -> bool {
        matches!(self, Self::BrowserTest | Self::Deploy)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Architecture => "architecture",
            Self::CodeGeneration => "code_generation",
            Self::CodeReview => "code_review",
            Self::AdversarialReview => "adversarial_review",
            Self::BrowserTest => "browser_test",
            Self::BrandReview => "brand_review",
            Self::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Structural check applied to a successful backend response
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputCheck {
    /// Accept anything
    None,
    /// Content must contain non-whitespace text
    #[default]
    NonEmpty,
    /// Content must parse as a JSON object
    JsonObject,
}

impl OutputCheck {
    /// Validate response content, returning the reason on rejection
    pub fn validate(&self, content: &str) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::NonEmpty => {
                if content.trim().is_empty() {
                    Err("empty response".to_string())
                } else {
                    Ok(())
                }
            }
            Self::JsonObject => match serde_json::from_str::<serde_json::Value>(content) {
                Ok(serde_json::Value::Object(_)) => Ok(()),
                Ok(_) => Err("response is JSON but not an object".to_string()),
                Err(e) => Err(format!("response is not valid JSON: {e}")),
            },
        }
    }
}

/// One ordered step of a job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,

    /// Opaque payload forwarded to the backend adapter
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Overrides the stage kind's resource requirement
    #[serde(default)]
    pub needs_resource: Option<bool>,

    #[serde(default)]
    pub output_check: OutputCheck,
}

impl Stage {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            payload: serde_json::Value::Null,
            needs_resource: None,
            output_check: OutputCheck::default(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_resource(mut self, needs_resource: bool) -> Self {
        self.needs_resource = Some(needs_resource);
        self
    }

    #[must_use]
    pub fn with_output_check(mut self, check: OutputCheck) -> Self {
        self.output_check = check;
        self
    }

    #[must_use]
    pub fn requires_resource(&self) -> bool {
        self.needs_resource
            .unwrap_or_else(|| self.kind.needs_resource())
    }
}

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this state is final (succeeded, failed, or cancelled)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Cancellation and Cost
// ============================================================================

/// Cooperative cancellation flag shared between the dispatcher and a worker
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single charged backend call
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CostEntry {
    pub backend_id: String,
    pub consumed_units: u64,
    pub cost: f64,
}

/// Append-only cost ledger for one job
///
/// Charges are never negative, so the total is monotonically
/// non-decreasing over the job's lifetime.
#[derive(Debug, Default)]
pub struct CostLedger {
    entries: Mutex<Vec<CostEntry>>,
}

impl CostLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call's consumption at the backend's unit price
    pub fn charge(&self, backend_id: &str, consumed_units: u64, unit_price: f64) -> f64 {
        let cost = (consumed_units as f64 * unit_price).max(0.0);
        self.entries.lock().push(CostEntry {
            backend_id: backend_id.to_string(),
            consumed_units,
            cost,
        });
        cost
    }

    /// Accumulated cost so far
    #[must_use]
    pub fn total(&self) -> f64 {
        self.entries.lock().iter().map(|e| e.cost).sum()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<CostEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Job
// ============================================================================

/// Client-facing job specification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-chosen identifier; generated when absent
    #[serde(default)]
    pub id: Option<JobId>,
    pub task_kind: TaskKind,
    pub complexity: Complexity,
    pub stages: Vec<Stage>,
}

impl JobSpec {
    pub fn new(task_kind: TaskKind, complexity: Complexity, stages: Vec<Stage>) -> Self {
        Self {
            id: None,
            task_kind,
            complexity,
            stages,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(JobId::new(id));
        self
    }
}

/// Output of one completed stage
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageOutput {
    pub stage: StageKind,
    pub backend_id: String,
    pub content: String,
    pub escalations: usize,
}

/// A job in flight
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub task_kind: TaskKind,
    pub complexity: Complexity,
    pub stages: Vec<Stage>,

    /// Index of the next stage to run
    pub current_stage: usize,

    /// Backend calls made per stage
    pub attempts: Vec<u32>,

    pub outputs: Vec<StageOutput>,

    pub cost: Arc<CostLedger>,
    pub cancel: CancelFlag,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a specification under the given identifier
    pub fn from_spec(id: JobId, spec: JobSpec) -> Self {
        let stage_count = spec.stages.len();
        Self {
            id,
            task_kind: spec.task_kind,
            complexity: spec.complexity,
            stages: spec.stages,
            current_stage: 0,
            attempts: vec![0; stage_count],
            outputs: Vec::with_capacity(stage_count),
            cost: Arc::new(CostLedger::new()),
            cancel: CancelFlag::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.attempts.iter().sum()
    }

    #[must_use]
    pub fn remaining_stages(&self) -> usize {
        self.stages.len().saturating_sub(self.current_stage)
    }
}

// ============================================================================
// Tests
// ============================================================================
