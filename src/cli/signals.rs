//! Signal handling for graceful shutdown

use crate::workflow::WorkflowEngine;
use std::sync::Arc;

/// Cancel every active execution when the process is interrupted. The step
/// loop observes the cancellation at its next step boundary; abort the
/// returned task once the run finishes normally.
pub fn spawn_cancel_on_interrupt(engine: Arc<WorkflowEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = engine.cancel_active();
            eprintln!("\nInterrupt received; cancelled {cancelled} active execution(s)");
        }
    })
}
