//! Workflow execution engine
//!
//! Owns the registry, the agent registry, the store handle, and the shared
//! execution map; all run state lives here, built once at startup.

use super::execution::{ExecutionStatus, StepOutcome, WorkflowExecution};
use super::monitor::ExecutionMonitor;
use super::quality::{QualityGate, QualityReport, enhance_retry_parameters};
use super::rollback::{RollbackRecorder, rollback};
use super::template::resolve_parameters;
use super::{SharedExecutions, lock};
use crate::agents::{AgentRegistry, OperationContext};
use crate::cancel::CancellationToken;
use crate::config::{ParamMap, StepConfig, WorkflowConfig, WorkflowRegistry};
use crate::store::{KnowledgeStore, RunRecord};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("execution '{0}' not found")]
    UnknownExecution(String),

    #[error("execution '{id}' is already {status}")]
    NotCancellable { id: String, status: ExecutionStatus },
}

/// Snapshot returned by [`WorkflowEngine::health_check`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub active_executions: usize,
    pub retained_executions: usize,
    pub registered_workflows: usize,
    pub registered_capabilities: usize,
    pub store_reachable: bool,
}

/// The orchestrator: drives steps through dependency checks, deadline
/// racing, quality-gated retry, and rollback.
pub struct WorkflowEngine {
    registry: WorkflowRegistry,
    agents: AgentRegistry,
    store: Arc<KnowledgeStore>,
    executions: SharedExecutions,
}

impl WorkflowEngine {
    pub fn new(registry: WorkflowRegistry, agents: AgentRegistry, store: Arc<KnowledgeStore>) -> Self {
        Self {
            registry,
            agents,
            store,
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// Monitor bound to this engine's execution map
    pub fn monitor(&self) -> ExecutionMonitor {
        ExecutionMonitor::new(Arc::clone(&self.executions))
    }

    /// Execute a registered workflow to a terminal state.
    ///
    /// An unregistered name yields a terminal failed execution that is
    /// returned to the caller but never inserted into the execution map.
    pub async fn execute(&self, workflow_name: &str, parameters: ParamMap) -> WorkflowExecution {
        let Some(workflow) = self.registry.get(workflow_name) else {
            let error = format!(
                "workflow '{workflow_name}' is not registered (available: {})",
                self.registry.names().join(", ")
            );
            tracing::error!(workflow = workflow_name, "Rejected execution request");
            return WorkflowExecution::rejected(workflow_name, error);
        };

        // Make the resumability point available to checkpoint-scoped steps;
        // an explicit caller value wins.
        let mut caller_params = parameters;
        match self.store.checkpoint(workflow_name) {
            Ok(Some(checkpoint)) => {
                caller_params
                    .entry("checkpoint".to_string())
                    .or_insert_with(|| Value::String(checkpoint));
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(error = %error, "Failed to read checkpoint; proceeding without one");
            }
        }

        if workflow.settings.max_concurrent_steps > 1 {
            tracing::warn!(
                workflow = %workflow.name,
                declared = workflow.settings.max_concurrent_steps,
                "max_concurrent_steps is declared but execution is sequential"
            );
        }

        let execution = WorkflowExecution::new(
            &workflow.name,
            workflow.steps.len(),
            workflow.settings.max_duration,
        );
        let id = execution.id.clone();
        let handle = Arc::new(Mutex::new(execution));
        lock(&self.executions).insert(id.clone(), Arc::clone(&handle));

        lock(&handle).begin();
        tracing::info!(
            execution = %id,
            workflow = %workflow.name,
            steps = workflow.steps.len(),
            "Starting workflow execution"
        );

        let recorder = RollbackRecorder::new();
        let gate = QualityGate::new(workflow.settings.quality.clone())
            .with_store(Arc::clone(&self.store));
        let mut abort: Option<String> = None;

        for (index, step) in workflow.steps.iter().enumerate() {
            // Cancellation and monitor force-failure are observed at step
            // boundaries; an in-progress step is never interrupted.
            {
                let mut execution = lock(&handle);
                if execution.status != ExecutionStatus::Running {
                    tracing::warn!(
                        execution = %id,
                        status = %execution.status,
                        "Execution left the running state; stopping step loop"
                    );
                    break;
                }
                execution.advance_to(index);
            }

            let missing = step
                .depends_on
                .iter()
                .find(|dep| !lock(&handle).dependency_ready(dep.as_str()));
            if let Some(dep) = missing {
                abort = Some(format!(
                    "step '{}' dependency violation: result for '{}' is missing or failed",
                    step.name, dep
                ));
                break;
            }

            if let Err(reason) = self
                .run_step(&workflow, step, &caller_params, &handle, &recorder, &gate)
                .await
            {
                abort = Some(reason);
                break;
            }
        }

        self.finish(&workflow, &handle, &recorder, abort);
        lock(&handle).clone()
    }

    /// Run one step to a stored outcome, or return the reason to abort the run
    async fn run_step(
        &self,
        workflow: &WorkflowConfig,
        step: &StepConfig,
        caller_params: &ParamMap,
        handle: &Arc<Mutex<WorkflowExecution>>,
        recorder: &RollbackRecorder,
        gate: &QualityGate,
    ) -> Result<(), String> {
        let op = match self.agents.resolve(&step.agent, &step.operation) {
            Ok(op) => op,
            Err(error) => {
                // Definition error: surfaced immediately, no retry
                let message = format!("step '{}': {error}", step.name);
                lock(handle).record_outcome(&step.name, StepOutcome::failure(message.clone(), 0, 0, 0));
                return Err(message);
            }
        };

        let max_attempts = workflow.settings.max_retries.max(1);
        let base_deadline = Duration::from_secs(step.timeout_secs());
        let mut step_reports: Vec<QualityReport> = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            // Merge step-declared and caller-supplied parameters (caller wins
            // on the same key), then resolve templates against prior results.
            // Repeated from scratch every attempt so enhancement hints and
            // fresh results are both picked up.
            let mut params = step.params.clone();
            for (key, value) in caller_params {
                params.insert(key.clone(), value.clone());
            }
            if attempt > 1 && !step_reports.is_empty() {
                enhance_retry_parameters(&mut params, &step_reports, attempt);
            }
            {
                let execution = lock(handle);
                resolve_parameters(&mut params, &execution.results);
            }

            // Deadline grows with the attempt number
            let deadline = base_deadline * attempt;
            let deadline_ms = deadline.as_millis() as u64;
            let cancel = CancellationToken::new();
            let ctx = OperationContext {
                params,
                cancel: cancel.clone(),
                actions: recorder.clone(),
                store: Arc::clone(&self.store),
            };

            tracing::debug!(
                step = %step.name,
                agent = %step.agent,
                operation = %step.operation,
                attempt,
                deadline_secs = deadline.as_secs(),
                "Invoking step operation"
            );
            let attempt_start = Instant::now();
            let raced = tokio::time::timeout(deadline, op.call(ctx)).await;
            let duration_ms = attempt_start.elapsed().as_millis() as u64;

            let raw = match raced {
                Err(_elapsed) => {
                    // Deadline expiry signals the operation's token; anything
                    // it spawned can observe it and stop.
                    cancel.cancel();
                    last_error = format!(
                        "step '{}' timed out after {}s (attempt {attempt}/{max_attempts})",
                        step.name,
                        deadline.as_secs()
                    );
                    tracing::warn!(step = %step.name, attempt, "Step deadline expired");
                    if attempt < max_attempts {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    lock(handle).record_outcome(
                        &step.name,
                        StepOutcome::failure(last_error.clone(), duration_ms, deadline_ms, attempt),
                    );
                    return Err(last_error);
                }
                Ok(Err(error)) => {
                    last_error = format!("step '{}' operation failed: {error}", step.name);
                    if !error.is_retryable() {
                        lock(handle).record_outcome(
                            &step.name,
                            StepOutcome::failure(last_error.clone(), duration_ms, deadline_ms, attempt),
                        );
                        return Err(last_error);
                    }
                    tracing::warn!(step = %step.name, attempt, error = %error, "Step operation failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    lock(handle).record_outcome(
                        &step.name,
                        StepOutcome::failure(last_error.clone(), duration_ms, deadline_ms, attempt),
                    );
                    return Err(last_error);
                }
                Ok(Ok(raw)) => raw,
            };

            if !workflow.settings.qa_validation {
                lock(handle).record_outcome(
                    &step.name,
                    StepOutcome::success(raw, duration_ms, deadline_ms, attempt),
                );
                return Ok(());
            }

            let report = gate.evaluate(step, &raw);
            let passed = report.passed;
            let corrected = report.corrected_value.clone();
            let errors = report.errors.join("; ");
            lock(handle).qa_reports.push(report.clone());
            step_reports.push(report);

            if passed {
                let value = corrected.unwrap_or(raw);
                lock(handle).record_outcome(
                    &step.name,
                    StepOutcome::success(value, duration_ms, deadline_ms, attempt),
                );
                return Ok(());
            }

            last_error = format!("step '{}' failed quality validation: {errors}", step.name);
            tracing::warn!(step = %step.name, attempt, errors = %errors, "Quality gate rejected step result");

            if attempt < max_attempts {
                // Retry the same step with enhanced parameters
                continue;
            }

            let outcome =
                StepOutcome::failure(last_error.clone(), duration_ms, deadline_ms, attempt);
            if workflow.settings.allow_partial_completion {
                let mut execution = lock(handle);
                execution.record_outcome(&step.name, outcome);
                execution.record_error(last_error.clone());
                tracing::warn!(step = %step.name, "Recording failed step under partial completion");
                return Ok(());
            }
            lock(handle).record_outcome(&step.name, outcome);
            return Err(last_error);
        }

        Err(last_error)
    }

    /// Terminalize the run: complete + checkpoint, or fail + rollback, or
    /// leave an externally-set terminal state as-is. Always persists a run
    /// record; none of these failures propagate to the caller.
    fn finish(
        &self,
        workflow: &WorkflowConfig,
        handle: &Arc<Mutex<WorkflowExecution>>,
        recorder: &RollbackRecorder,
        abort: Option<String>,
    ) {
        let actions = recorder.snapshot();

        let (id, do_rollback, completed) = {
            let mut execution = lock(handle);
            execution.rollback_log = actions.clone();
            match abort {
                Some(reason) => {
                    tracing::error!(execution = %execution.id, error = %reason, "Workflow failed");
                    execution.fail(reason);
                    execution.rollback_attempted = true;
                    (execution.id.clone(), true, false)
                }
                None if execution.status == ExecutionStatus::Running => {
                    execution.complete();
                    tracing::info!(
                        execution = %execution.id,
                        duration_ms = execution.duration_ms(),
                        "Workflow completed"
                    );
                    (execution.id.clone(), false, true)
                }
                // Cancelled or force-failed from outside the step loop
                None => (execution.id.clone(), false, false),
            }
        };

        if do_rollback {
            let outcome = rollback(&actions, &self.store);
            let mut execution = lock(handle);
            for (target, error) in &outcome.failed {
                execution.record_error(format!("rollback failed for {target}: {error}"));
            }
            execution.rollback_succeeded = outcome.is_complete();
            tracing::info!(
                execution = %id,
                undone = outcome.undone.len(),
                failed = outcome.failed.len(),
                "Rollback finished"
            );
        }

        if completed {
            // The run's start time becomes the new resumability point, so
            // commits landing mid-run fall into the next incremental window.
            let checkpoint = lock(handle).started_at.to_rfc3339();
            if let Err(error) = self.store.set_checkpoint(&workflow.name, &checkpoint) {
                // Logged only; a completed run never flips to failed here
                tracing::error!(execution = %id, error = %error, "Failed to advance checkpoint");
            }
        }

        let record = {
            let execution = lock(handle);
            RunRecord {
                execution_id: execution.id.clone(),
                workflow_name: execution.workflow.clone(),
                success: execution.status == ExecutionStatus::Completed,
                duration_ms: execution.duration_ms(),
                error: execution.errors.first().cloned(),
                created_at: Utc::now().to_rfc3339(),
            }
        };
        if let Err(error) = self.store.record_run(&record) {
            tracing::warn!(execution = %id, error = %error, "Failed to persist run record");
        }
    }

    pub fn get_execution(&self, id: &str) -> Option<WorkflowExecution> {
        lock(&self.executions).get(id).map(|e| lock(e).clone())
    }

    pub fn active_executions(&self) -> Vec<WorkflowExecution> {
        lock(&self.executions)
            .values()
            .map(|e| lock(e).clone())
            .filter(|e| e.status.is_active())
            .collect()
    }

    /// Terminal executions, most recent first
    pub fn execution_history(&self, limit: usize) -> Vec<WorkflowExecution> {
        let mut history: Vec<_> = lock(&self.executions)
            .values()
            .map(|e| lock(e).clone())
            .filter(|e| e.status.is_terminal())
            .collect();
        history.sort_by(|a, b| b.effective_end().cmp(&a.effective_end()));
        history.truncate(limit);
        history
    }

    /// The single externally-allowed transition: an active run becomes
    /// `cancelled`. Does not interrupt an in-progress step; the loop observes
    /// the terminal state at the next boundary.
    pub fn cancel_workflow(&self, id: &str) -> Result<WorkflowExecution, EngineError> {
        let map = lock(&self.executions);
        let Some(handle) = map.get(id) else {
            return Err(EngineError::UnknownExecution(id.to_string()));
        };
        let mut execution = lock(handle);
        if execution.cancel() {
            tracing::info!(execution = %id, "Cancelled workflow execution");
            Ok(execution.clone())
        } else {
            Err(EngineError::NotCancellable {
                id: id.to_string(),
                status: execution.status,
            })
        }
    }

    /// Cancel every active execution; returns how many were flipped
    pub fn cancel_active(&self) -> usize {
        let map = lock(&self.executions);
        map.values()
            .filter(|handle| lock(handle).cancel())
            .count()
    }

    pub fn health_check(&self) -> HealthReport {
        let map = lock(&self.executions);
        let active = map
            .values()
            .filter(|e| lock(e).status.is_active())
            .count();
        HealthReport {
            active_executions: active,
            retained_executions: map.len(),
            registered_workflows: self.registry.len(),
            registered_capabilities: self.agents.capability_count(),
            store_reachable: self.store.entity_count().is_ok(),
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped at 10s. Applied between
/// operation-failure attempts; quality retries go straight back in with
/// enhanced parameters.
fn retry_delay(attempt: u32) -> Duration {
    let base = 0.5 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(10.0);
    let jitter = rand::random::<f64>() * 0.25 * capped;
    Duration::from_secs_f64(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentError, AgentResult, Operation};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Returns its resolved parameters as the result object
    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Operation for Echo {
        async fn call(&self, ctx: OperationContext) -> AgentResult {
            Ok(Value::Object(ctx.params))
        }
    }

    /// Counts invocations, then echoes
    #[derive(Debug)]
    struct Counting {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Operation for Counting {
        async fn call(&self, ctx: OperationContext) -> AgentResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(ctx.params))
        }
    }

    /// Produces an empty entity list (a non-correctable quality failure) for
    /// the first `fail_times` calls, then a valid knowledge-graph payload.
    /// Captures the parameters of every call.
    #[derive(Debug)]
    struct FlakyEntities {
        fail_times: u32,
        calls: Arc<AtomicU32>,
        seen_params: Arc<Mutex<Vec<ParamMap>>>,
    }

    impl FlakyEntities {
        fn new(fail_times: u32) -> Self {
            Self {
                fail_times,
                calls: Arc::new(AtomicU32::new(0)),
                seen_params: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Operation for FlakyEntities {
        async fn call(&self, ctx: OperationContext) -> AgentResult {
            lock(&self.seen_params).push(ctx.params.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Ok(json!({"entities": [], "relations": [], "significance": 5}))
            } else {
                Ok(json!({
                    "entities": [{"name": "GoodEntity", "entity_type": "component"}],
                    "relations": [],
                    "significance": 7,
                }))
            }
        }
    }

    /// Sleeps well past any 1s deadline
    #[derive(Debug)]
    struct Sleeper;

    #[async_trait]
    impl Operation for Sleeper {
        async fn call(&self, _ctx: OperationContext) -> AgentResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({"slept": true}))
        }
    }

    /// Always fails with a retryable error
    #[derive(Debug)]
    struct AlwaysFails {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Operation for AlwaysFails {
        async fn call(&self, _ctx: OperationContext) -> AgentResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Failed("transient backend error".into()))
        }
    }

    /// Fails with a non-retryable error
    #[derive(Debug)]
    struct BadParams {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Operation for BadParams {
        async fn call(&self, _ctx: OperationContext) -> AgentResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::InvalidParams("unusable".into()))
        }
    }

    /// Creates a file and an entity, recording both side effects
    #[derive(Debug)]
    struct SideEffects {
        dir: std::path::PathBuf,
    }

    #[async_trait]
    impl Operation for SideEffects {
        async fn call(&self, ctx: OperationContext) -> AgentResult {
            let path = self.dir.join("artifact.md");
            std::fs::write(&path, "artifact")?;
            ctx.actions.file_created(&path);
            ctx.store
                .upsert_entity("SideEffectEntity", "artifact", &[])
                .map_err(|e| AgentError::Store(e.to_string()))?;
            ctx.actions.entity_created("SideEffectEntity");
            Ok(json!({"path": path.display().to_string()}))
        }
    }

    fn probe_step(name: &str, deps: &[&str]) -> StepConfig {
        StepConfig {
            name: name.into(),
            agent: "probe".into(),
            operation: "echo".into(),
            params: ParamMap::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            description: String::new(),
        }
    }

    fn workflow(name: &str, steps: Vec<StepConfig>) -> WorkflowConfig {
        WorkflowConfig {
            name: name.into(),
            description: String::new(),
            settings: Default::default(),
            steps,
        }
    }

    fn engine_with(workflows: Vec<WorkflowConfig>, agents: AgentRegistry) -> WorkflowEngine {
        let mut registry = WorkflowRegistry::new();
        for w in workflows {
            registry.register(w).unwrap();
        }
        let store = Arc::new(KnowledgeStore::in_memory().unwrap());
        WorkflowEngine::new(registry, agents, store)
    }

    fn probe_agents() -> AgentRegistry {
        let mut agents = AgentRegistry::new();
        agents.register("probe", "echo", Arc::new(Echo));
        agents
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_rejected_without_record() {
        let engine = engine_with(vec![], AgentRegistry::new());

        let execution = engine.execute("ghost", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.errors[0].contains("not registered"));
        // No long-lived record is created
        assert!(engine.get_execution(&execution.id).is_none());
        assert!(engine.execution_history(10).is_empty());
    }

    #[tokio::test]
    async fn test_success_with_dependency_and_template() {
        let mut step_one = probe_step("one", &[]);
        step_one.params.insert("v".into(), json!(41));
        let mut step_two = probe_step("two", &["one"]);
        step_two.params.insert("input".into(), json!("{{one.v}}"));

        let engine = engine_with(
            vec![workflow("chain", vec![step_one, step_two])],
            probe_agents(),
        );

        let execution = engine.execute("chain", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.results.len(), 2);
        let two = execution.results.get("two").unwrap();
        assert_eq!(two.value.as_ref().unwrap()["input"], json!(41));
        // Checkpoint advanced to the run's start time
        let checkpoint = engine.store().checkpoint("chain").unwrap().unwrap();
        assert_eq!(checkpoint, execution.started_at.to_rfc3339());
        // The record is queryable afterwards
        assert_eq!(
            engine.get_execution(&execution.id).unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_caller_params_win_over_step_params() {
        let mut step = probe_step("solo", &[]);
        step.params.insert("v".into(), json!("from-step"));

        let engine = engine_with(vec![workflow("solo", vec![step])], probe_agents());

        let mut caller = ParamMap::new();
        caller.insert("v".into(), json!("from-caller"));
        let execution = engine.execute("solo", caller).await;

        let outcome = execution.results.get("solo").unwrap();
        assert_eq!(outcome.value.as_ref().unwrap()["v"], json!("from-caller"));
    }

    #[tokio::test]
    async fn test_errored_dependency_skips_step_invocation() {
        // Step "broken" exhausts quality retries but is recorded under
        // partial completion; step "after" depends on it and must never run.
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentRegistry::new();
        agents.register("knowledge-graph", "record_insights", Arc::new(FlakyEntities::new(10)));
        agents.register("probe", "echo", Arc::new(Counting { calls: Arc::clone(&calls) }));

        let broken = StepConfig {
            name: "broken".into(),
            agent: "knowledge-graph".into(),
            operation: "record_insights".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        let after = probe_step("after", &["broken"]);

        let mut wf = workflow("dep-check", vec![broken, after]);
        wf.settings.max_retries = 2;
        wf.settings.allow_partial_completion = true;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("dep-check", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.errors.iter().any(|e| e.contains("dependency violation")));
        // Operation call count for the dependent step is zero
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!execution.results.contains_key("after"));
    }

    #[tokio::test]
    async fn test_quality_retry_succeeds_on_third_attempt() {
        let flaky = Arc::new(FlakyEntities::new(2));
        let seen = Arc::clone(&flaky.seen_params);

        let mut agents = probe_agents();
        agents.register("knowledge-graph", "record_insights", flaky);

        let a = probe_step("a", &[]);
        let b = probe_step("b", &[]);
        let c = StepConfig {
            name: "c".into(),
            agent: "knowledge-graph".into(),
            operation: "record_insights".into(),
            params: ParamMap::new(),
            depends_on: vec!["a".into(), "b".into()],
            timeout: None,
            description: String::new(),
        };

        let mut wf = workflow("abc", vec![a, b, c]);
        wf.settings.max_retries = 3;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("abc", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let c_reports: Vec<_> = execution
            .qa_reports
            .iter()
            .filter(|r| r.step == "c")
            .collect();
        assert_eq!(c_reports.len(), 3);
        assert!(!c_reports[0].passed);
        assert!(!c_reports[1].passed);
        assert!(c_reports[2].passed);
        assert_eq!(execution.results.get("c").unwrap().attempts, 3);
        assert!(engine.store().checkpoint("abc").unwrap().is_some());

        // Every retry carried feedback from all prior attempts
        let seen = lock(&seen);
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].contains_key("retry_feedback"));
        let second_errors = seen[1]["retry_feedback"]["previous_errors"]
            .as_array()
            .unwrap()
            .len();
        let third_errors = seen[2]["retry_feedback"]["previous_errors"]
            .as_array()
            .unwrap()
            .len();
        assert!(second_errors >= 1);
        assert!(third_errors > second_errors);
        assert_eq!(seen[2]["retry_feedback"]["attempt"], json!(3));
    }

    #[tokio::test]
    async fn test_exhausted_retries_roll_back_side_effects() {
        let dir = TempDir::new().unwrap();

        let mut agents = AgentRegistry::new();
        agents.register(
            "artifacts",
            "produce",
            Arc::new(SideEffects {
                dir: dir.path().to_path_buf(),
            }),
        );
        agents.register("knowledge-graph", "record_insights", Arc::new(FlakyEntities::new(10)));

        let produce = StepConfig {
            name: "produce".into(),
            agent: "artifacts".into(),
            operation: "produce".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        let doomed = StepConfig {
            name: "doomed".into(),
            agent: "knowledge-graph".into(),
            operation: "record_insights".into(),
            params: ParamMap::new(),
            depends_on: vec!["produce".into()],
            timeout: None,
            description: String::new(),
        };

        let mut wf = workflow("rollback-run", vec![produce, doomed]);
        wf.settings.max_retries = 2;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("rollback-run", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.rollback_attempted);
        assert!(execution.rollback_succeeded);
        assert_eq!(execution.rollback_log.len(), 2);
        // File deleted, entity removed
        assert!(!dir.path().join("artifact.md").exists());
        assert!(engine.store().entity("SideEffectEntity").unwrap().is_none());
        // A failed run never advances the checkpoint
        assert!(engine.store().checkpoint("rollback-run").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_completion_records_failure_and_continues() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentRegistry::new();
        agents.register("knowledge-graph", "record_insights", Arc::new(FlakyEntities::new(10)));
        agents.register("probe", "echo", Arc::new(Counting { calls: Arc::clone(&calls) }));

        let doomed = StepConfig {
            name: "doomed".into(),
            agent: "knowledge-graph".into(),
            operation: "record_insights".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        // Independent of the failing step, so it still runs
        let independent = probe_step("independent", &[]);

        let mut wf = workflow("partial", vec![doomed, independent]);
        wf.settings.max_retries = 2;
        wf.settings.allow_partial_completion = true;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("partial", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.results.get("doomed").unwrap().failed);
        assert!(!execution.errors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.store().checkpoint("partial").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_fails_step_at_deadline() {
        let mut agents = AgentRegistry::new();
        agents.register("slow", "sleep", Arc::new(Sleeper));

        let step = StepConfig {
            name: "sleepy".into(),
            agent: "slow".into(),
            operation: "sleep".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: Some(1),
            description: String::new(),
        };
        let mut wf = workflow("timeouts", vec![step]);
        wf.settings.max_retries = 1;
        wf.settings.qa_validation = false;

        let engine = engine_with(vec![wf], agents);
        let start = Instant::now();
        let execution = engine.execute("timeouts", ParamMap::new()).await;

        // Recorded as a timed-out failure at ~1s; the 5s sleep is abandoned
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let outcome = execution.results.get("sleepy").unwrap();
        assert!(outcome.failed);
        assert!(outcome.error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_operation_failure_retried_to_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentRegistry::new();
        agents.register("flaky", "work", Arc::new(AlwaysFails { calls: Arc::clone(&calls) }));

        let step = StepConfig {
            name: "work".into(),
            agent: "flaky".into(),
            operation: "work".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        let mut wf = workflow("flaky-run", vec![step]);
        wf.settings.max_retries = 2;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("flaky-run", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(execution.results.get("work").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut agents = AgentRegistry::new();
        agents.register("bad", "work", Arc::new(BadParams { calls: Arc::clone(&calls) }));

        let step = StepConfig {
            name: "work".into(),
            agent: "bad".into(),
            operation: "work".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        let mut wf = workflow("bad-run", vec![step]);
        wf.settings.max_retries = 3;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("bad-run", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_capability_fails_with_alternatives() {
        let step = StepConfig {
            name: "mystery".into(),
            agent: "probe".into(),
            operation: "transmute".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: None,
            description: String::new(),
        };
        let engine = engine_with(vec![workflow("mystery", vec![step])], probe_agents());

        let execution = engine.execute("mystery", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.errors[0].contains("no operation 'transmute'"));
        assert!(execution.errors[0].contains("echo"));
    }

    #[tokio::test]
    async fn test_cancel_workflow_mid_run() {
        let mut agents = AgentRegistry::new();
        agents.register("slow", "sleep", Arc::new(Sleeper));

        let step = StepConfig {
            name: "sleepy".into(),
            agent: "slow".into(),
            operation: "sleep".into(),
            params: ParamMap::new(),
            depends_on: vec![],
            timeout: Some(30),
            description: String::new(),
        };
        let mut wf = workflow("cancellable", vec![step, probe_step("after", &[])]);
        wf.settings.qa_validation = false;

        let engine = Arc::new(engine_with(vec![wf], {
            let mut agents = agents;
            agents.register("probe", "echo", Arc::new(Echo));
            agents
        }));

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.execute("cancellable", ParamMap::new()).await });

        // Wait for the run to appear, then cancel it from outside
        let mut active = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            active = engine.active_executions();
            if !active.is_empty() {
                break;
            }
        }
        let id = active[0].id.clone();
        let cancelled = engine.cancel_workflow(&id).unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        // A second cancel is rejected
        assert!(matches!(
            engine.cancel_workflow(&id),
            Err(EngineError::NotCancellable { .. })
        ));

        let execution = task.await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        // The in-progress step's result was dropped; nothing after it ran
        assert!(execution.results.is_empty());
        // A cancelled run never advances the checkpoint
        assert!(engine.store().checkpoint("cancellable").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_qa_disabled_skips_gate() {
        #[derive(Debug)]
        struct Stringy;

        #[async_trait]
        impl Operation for Stringy {
            async fn call(&self, _ctx: OperationContext) -> AgentResult {
                Ok(json!("not an object"))
            }
        }

        let mut agents = AgentRegistry::new();
        agents.register("probe", "echo", Arc::new(Stringy));

        let mut wf = workflow("no-qa", vec![probe_step("solo", &[])]);
        wf.settings.qa_validation = false;

        let engine = engine_with(vec![wf], agents);
        let execution = engine.execute("no-qa", ParamMap::new()).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.qa_reports.is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        let engine = engine_with(
            vec![workflow("w", vec![probe_step("s", &[])])],
            probe_agents(),
        );

        engine.execute("w", ParamMap::new()).await;
        let health = engine.health_check();

        assert_eq!(health.active_executions, 0);
        assert_eq!(health.retained_executions, 1);
        assert_eq!(health.registered_workflows, 1);
        assert_eq!(health.registered_capabilities, 1);
        assert!(health.store_reachable);
    }

    #[test]
    fn test_retry_delay_monotonic_base() {
        // Jitter aside, the base doubles per attempt and caps at 10s
        let d1 = retry_delay(1);
        let d4 = retry_delay(4);
        assert!(d1 >= Duration::from_millis(500));
        assert!(d1 <= Duration::from_millis(625));
        assert!(d4 >= Duration::from_secs(4));
        assert!(d4 <= Duration::from_secs(5));
    }
}
