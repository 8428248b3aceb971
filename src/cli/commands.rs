//! CLI command implementations

use super::output::{OutputMode, print_execution, print_runs};
use super::signals;
use crate::config::ParamMap;
use crate::workflow::{ExecutionStatus, WorkflowEngine};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Run a workflow to completion and print the post-mortem
pub async fn run_workflow(
    engine: Arc<WorkflowEngine>,
    workflow_name: &str,
    args: Vec<String>,
    working_dir: &Path,
    mode: OutputMode,
) -> i32 {
    let mut params = parse_workflow_args(&args);
    // The project directory doubles as the default analysis target
    params
        .entry("repository".to_string())
        .or_insert_with(|| Value::String(working_dir.display().to_string()));

    let interrupt = signals::spawn_cancel_on_interrupt(Arc::clone(&engine));
    let execution = engine.execute(workflow_name, params).await;
    interrupt.abort();

    print_execution(&execution, mode);
    match execution.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    }
}

/// Show a registered workflow's shape without running it
pub fn validate_workflow(engine: &WorkflowEngine, workflow_name: &str) -> i32 {
    match engine.registry().get(workflow_name) {
        Some(workflow) => {
            println!("✓ Workflow '{}' is valid", workflow.name);
            if !workflow.description.is_empty() {
                println!("  {}", workflow.description);
            }
            println!("  {} step(s):", workflow.steps.len());
            for step in &workflow.steps {
                let deps = if step.depends_on.is_empty() {
                    String::new()
                } else {
                    format!("  (after {})", step.depends_on.join(", "))
                };
                println!(
                    "    {} -> {}.{} [{}s]{}",
                    step.name,
                    step.agent,
                    step.operation,
                    step.timeout_secs(),
                    deps
                );
            }
            0
        }
        None => {
            eprintln!(
                "✗ Unknown workflow '{}' (available: {})",
                workflow_name,
                engine.registry().names().join(", ")
            );
            1
        }
    }
}

/// List registered workflows
pub fn list_workflows(engine: &WorkflowEngine) -> i32 {
    for name in engine.registry().names() {
        if let Some(workflow) = engine.registry().get(name) {
            println!("{:<24} {} step(s)  {}", name, workflow.steps.len(), workflow.description);
        }
    }
    0
}

/// Show recent runs from the knowledge store
pub fn history(engine: &WorkflowEngine, limit: usize, mode: OutputMode) -> i32 {
    match engine.store().recent_runs(limit) {
        Ok(runs) => {
            print_runs(&runs, mode);
            0
        }
        Err(error) => {
            eprintln!("failed to read run history: {error}");
            1
        }
    }
}

/// Check agents, workflows, and store reachability
pub fn doctor(engine: &WorkflowEngine) -> i32 {
    let health = engine.health_check();

    println!("Agents:");
    for agent in engine.agents().agent_names() {
        for operation in engine.agents().operations(&agent) {
            println!("  {agent}.{operation}");
        }
    }
    println!("\nWorkflows: {}", engine.registry().names().join(", "));
    println!(
        "\nStore: {}",
        if health.store_reachable { "ok" } else { "unreachable" }
    );
    println!(
        "Executions: {} active, {} retained",
        health.active_executions, health.retained_executions
    );

    if health.store_reachable { 0 } else { 1 }
}

/// Parse `key=value` workflow arguments. Values that parse as JSON keep
/// their type; everything else is a string.
fn parse_workflow_args(args: &[String]) -> ParamMap {
    let mut params = ParamMap::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) => {
                let parsed = serde_json::from_str::<Value>(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                params.insert(key.to_string(), parsed);
            }
            None => {
                tracing::warn!(arg = %arg, "Ignoring workflow argument without '='");
            }
        }
    }
    params
}
