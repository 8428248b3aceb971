//! Output rendering for CLI commands
//!
//! Console (pretty), JSON, and quiet modes.

use crate::store::RunRecord;
use crate::workflow::{ExecutionStatus, WorkflowExecution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Render a terminal execution as a post-mortem
pub fn print_execution(execution: &WorkflowExecution, mode: OutputMode) {
    match mode {
        OutputMode::Quiet => {}
        OutputMode::Json => match serde_json::to_string_pretty(execution) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("failed to serialize execution: {e}"),
        },
        OutputMode::Console => print_console(execution),
    }
}

fn print_console(execution: &WorkflowExecution) {
    let mark = match execution.status {
        ExecutionStatus::Completed => "✓",
        ExecutionStatus::Cancelled => "−",
        _ => "✗",
    };
    println!(
        "{} Workflow '{}' {} in {} ({})",
        mark,
        execution.workflow,
        execution.status,
        format_ms(execution.duration_ms().max(0) as u64),
        execution.id
    );

    if !execution.results.is_empty() {
        println!("\nSteps:");
        let mut steps: Vec<_> = execution.results.iter().collect();
        steps.sort_by(|a, b| a.0.cmp(b.0));
        for (name, outcome) in steps {
            let mark = if outcome.failed { "✗" } else { "✓" };
            let attempts = if outcome.attempts == 1 {
                String::new()
            } else {
                format!(", {} attempts", outcome.attempts)
            };
            println!(
                "  {} {:<24} {:>8}{}",
                mark,
                name,
                format_ms(outcome.duration_ms),
                attempts
            );
            if let Some(ref error) = outcome.error {
                println!("      {error}");
            }
        }
    }

    if !execution.qa_reports.is_empty() {
        let corrected = execution.qa_reports.iter().filter(|r| r.corrected).count();
        let failed = execution.qa_reports.iter().filter(|r| !r.passed).count();
        println!(
            "\nQuality: {} evaluation(s), {} rejected, {} auto-corrected",
            execution.qa_reports.len(),
            failed,
            corrected
        );
    }

    if !execution.errors.is_empty() {
        println!("\nErrors:");
        for error in &execution.errors {
            println!("  - {error}");
        }
    }

    if execution.rollback_attempted {
        let verdict = if execution.rollback_succeeded {
            "complete"
        } else {
            "partial"
        };
        println!(
            "\nRollback: {} ({} recorded action(s))",
            verdict,
            execution.rollback_log.len()
        );
    }

    let perf = execution.performance_summary();
    println!(
        "\nPerformance: {}/100 ({} bottleneck(s), {} error(s))",
        perf.score,
        perf.bottlenecks.len(),
        perf.error_count
    );
    for bottleneck in &perf.bottlenecks {
        println!(
            "  slow step {} used {:.0}% of its deadline",
            bottleneck.step,
            bottleneck.utilization * 100.0
        );
    }
}

/// Render stored run records
pub fn print_runs(runs: &[RunRecord], mode: OutputMode) {
    if mode == OutputMode::Quiet {
        return;
    }
    if runs.is_empty() {
        println!("(no recorded runs)");
        return;
    }
    for run in runs {
        let mark = if run.success { "✓" } else { "✗" };
        print!(
            "{} {:<24} {:>8}  {}",
            mark,
            run.workflow_name,
            format_ms(run.duration_ms.max(0) as u64),
            run.created_at
        );
        match run.error {
            Some(ref error) => println!("  {error}"),
            None => println!(),
        }
    }
}

pub fn format_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}
