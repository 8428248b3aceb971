//! Workflow execution state

use super::quality::QualityReport;
use super::rollback::RollbackAction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Run status; a strict forward state machine
/// (pending → running → {completed | failed | cancelled})
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Stored result (or error marker) for one step
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub value: Option<Value>,
    pub failed: bool,
    pub error: Option<String>,
    /// Wall-clock duration of the deciding attempt, in milliseconds
    pub duration_ms: u64,
    /// Deadline that applied to that attempt, in milliseconds
    pub deadline_ms: u64,
    pub attempts: u32,
}

impl StepOutcome {
    pub fn success(value: Value, duration_ms: u64, deadline_ms: u64, attempts: u32) -> Self {
        Self {
            value: Some(value),
            failed: false,
            error: None,
            duration_ms,
            deadline_ms,
            attempts,
        }
    }

    pub fn failure(error: String, duration_ms: u64, deadline_ms: u64, attempts: u32) -> Self {
        Self {
            value: None,
            failed: true,
            error: Some(error),
            duration_ms,
            deadline_ms,
            attempts,
        }
    }

    /// Fraction of the deadline this step consumed
    pub fn timeout_utilization(&self) -> f64 {
        if self.deadline_ms == 0 {
            return 0.0;
        }
        self.duration_ms as f64 / self.deadline_ms as f64
    }
}

/// One run of a workflow. Owned and mutated exclusively by the engine;
/// observers (monitor, status queries) receive clones or flip it to a
/// terminal state, never backward.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    pub total_steps: usize,
    pub results: HashMap<String, StepOutcome>,
    pub errors: Vec<String>,
    pub qa_reports: Vec<QualityReport>,
    pub rollback_log: Vec<RollbackAction>,
    pub rollback_attempted: bool,
    pub rollback_succeeded: bool,
    /// Overall wall-clock budget, enforced by the monitor
    pub max_duration_secs: u64,
}

impl WorkflowExecution {
    pub fn new(workflow: &str, total_steps: usize, max_duration_secs: u64) -> Self {
        let started_at = Utc::now();
        Self {
            id: format!("{}-{}", workflow, started_at.format("%Y%m%d-%H%M%S%.6f")),
            workflow: workflow.to_string(),
            status: ExecutionStatus::Pending,
            started_at,
            ended_at: None,
            current_step: 0,
            total_steps,
            results: HashMap::new(),
            errors: Vec::new(),
            qa_reports: Vec::new(),
            rollback_log: Vec::new(),
            rollback_attempted: false,
            rollback_succeeded: false,
            max_duration_secs,
        }
    }

    /// Terminal failed record for definition errors; never enters the
    /// execution map.
    pub fn rejected(workflow: &str, error: String) -> Self {
        let mut execution = Self::new(workflow, 0, 0);
        execution.status = ExecutionStatus::Failed;
        execution.ended_at = Some(execution.started_at);
        execution.errors.push(error);
        execution
    }

    pub fn begin(&mut self) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Running;
        }
    }

    /// Move the step cursor forward; it never goes backward within a run
    pub fn advance_to(&mut self, index: usize) {
        self.current_step = self.current_step.max(index);
    }

    /// Record a step outcome. Ignored once the run has left `running`.
    pub fn record_outcome(&mut self, step: &str, outcome: StepOutcome) {
        if self.status != ExecutionStatus::Running {
            tracing::debug!(
                execution = %self.id,
                step = step,
                status = %self.status,
                "Dropping step outcome for terminal execution"
            );
            return;
        }
        self.results.insert(step.to_string(), outcome);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Whether a dependency's result is present and error-free
    pub fn dependency_ready(&self, step: &str) -> bool {
        self.results.get(step).is_some_and(|o| !o.failed)
    }

    pub fn complete(&mut self) -> bool {
        self.finish(ExecutionStatus::Completed)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let applied = self.finish(ExecutionStatus::Failed);
        if applied {
            self.errors.push(error.into());
        }
        applied
    }

    pub fn cancel(&mut self) -> bool {
        self.finish(ExecutionStatus::Cancelled)
    }

    fn finish(&mut self, terminal: ExecutionStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = terminal;
        self.ended_at = Some(Utc::now());
        true
    }

    /// End time, falling back to start time for runs still in flight
    pub fn effective_end(&self) -> DateTime<Utc> {
        self.ended_at.unwrap_or(self.started_at)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.effective_end() - self.started_at).num_milliseconds()
    }

    /// Diagnostic performance summary; never used for control decisions
    pub fn performance_summary(&self) -> PerformanceSummary {
        let total_ms: u64 = self.results.values().map(|o| o.duration_ms).sum();

        let mut bottlenecks: Vec<Bottleneck> = self
            .results
            .iter()
            .filter(|(_, o)| o.timeout_utilization() >= BOTTLENECK_UTILIZATION)
            .map(|(name, o)| Bottleneck {
                step: name.clone(),
                duration_ms: o.duration_ms,
                utilization: o.timeout_utilization(),
            })
            .collect();
        bottlenecks.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));

        let mut score = 100.0;
        score -= bottlenecks.len() as f64 * 12.0;
        score -= self.errors.len() as f64 * 15.0;
        score -= (total_ms as f64 / 60_000.0 * 5.0).min(30.0);

        PerformanceSummary {
            total_ms,
            score: score.clamp(0.0, 100.0) as u8,
            error_count: self.errors.len(),
            bottlenecks,
        }
    }
}

const BOTTLENECK_UTILIZATION: f64 = 0.75;

/// A step that consumed most of its deadline
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub step: String,
    pub duration_ms: u64,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub total_ms: u64,
    /// 0-100, derived from total duration, bottleneck count, and error count
    pub score: u8,
    pub error_count: usize,
    pub bottlenecks: Vec<Bottleneck>,
}
