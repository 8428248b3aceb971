//! Background execution monitor
//!
//! Periodically force-fails runs that exceed their workflow's wall-clock
//! budget and prunes the in-memory execution history to a bounded size.
//! Both the monitor and the step loop only ever move a run from `running` to
//! a terminal state, never backward, so the sweep is safe to interleave.

use super::execution::ExecutionStatus;
use super::{SharedExecutions, lock};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retained executions after a sweep, most-recent-first
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Sweep cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct ExecutionMonitor {
    executions: SharedExecutions,
    interval: Duration,
    max_history: usize,
}

impl ExecutionMonitor {
    pub fn new(executions: SharedExecutions) -> Self {
        Self {
            executions,
            interval: DEFAULT_SWEEP_INTERVAL,
            max_history: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Run the sweep on a fixed interval until the task is aborted
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Utc::now());
            }
        })
    }

    /// One pass: force-fail overdue runs, then prune history
    pub fn sweep(&self, now: DateTime<Utc>) {
        let map = lock(&self.executions);

        for execution in map.values() {
            let mut execution = lock(execution);
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            let elapsed = (now - execution.started_at).num_seconds();
            if elapsed >= 0 && elapsed as u64 > execution.max_duration_secs {
                let budget = execution.max_duration_secs;
                tracing::warn!(
                    execution = %execution.id,
                    elapsed_secs = elapsed,
                    budget_secs = budget,
                    "Force-failing execution past its wall-clock budget"
                );
                execution.fail(format!(
                    "exceeded maximum duration: {elapsed}s > {budget}s"
                ));
            }
        }
        drop(map);

        self.prune();
    }

    /// Keep the `max_history` most recent executions by end time (start time
    /// for runs still in flight); older entries are discarded entirely.
    fn prune(&self) {
        let mut map = lock(&self.executions);
        if map.len() <= self.max_history {
            return;
        }

        let mut ordered: Vec<(String, DateTime<Utc>)> = map
            .iter()
            .map(|(id, execution)| (id.clone(), lock(execution).effective_end()))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));

        let dropped = ordered.split_off(self.max_history);
        for (id, _) in &dropped {
            map.remove(id);
        }
        tracing::debug!(dropped = dropped.len(), retained = map.len(), "Pruned execution history");
    }
}
