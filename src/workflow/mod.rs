//! Workflow execution engine
//!
//! This module handles:
//! - Execution state and the status state machine
//! - The orchestration loop (dependency checks, deadlines, retries)
//! - Quality gating with auto-correction and retry-parameter synthesis
//! - Parameter template resolution against prior step results
//! - Reversible side-effect logging and rollback
//! - Background monitoring and history pruning

mod engine;
mod execution;
mod monitor;
mod quality;
mod rollback;
mod template;

pub use engine::{EngineError, HealthReport, WorkflowEngine};
pub use execution::{
    Bottleneck, ExecutionStatus, PerformanceSummary, StepOutcome, WorkflowExecution,
};
pub use monitor::{DEFAULT_HISTORY_LIMIT, DEFAULT_SWEEP_INTERVAL, ExecutionMonitor};
pub use quality::{QualityGate, QualityReport, enhance_retry_parameters};
pub use rollback::{RollbackAction, RollbackOutcome, RollbackRecorder, rollback};
pub use template::resolve_parameters;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// All live and retained executions, shared between the engine loop, the
/// monitor sweep, and status queries. Lock order is always map before entry.
pub(crate) type SharedExecutions = Arc<Mutex<HashMap<String, Arc<Mutex<WorkflowExecution>>>>>;

/// Poison-recovering lock: a panicked holder must not wedge the engine
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
