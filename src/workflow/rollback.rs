//! Reversible side-effect log and rollback execution
//!
//! Step implementations record actions through a [`RollbackRecorder`] handle
//! at the moment a side effect happens; the engine replays the log in reverse
//! when a run aborts.

use crate::store::KnowledgeStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A recorded reversible side effect
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RollbackAction {
    FileCreated {
        path: PathBuf,
        at: DateTime<Utc>,
    },
    FileModified {
        path: PathBuf,
        previous: String,
        at: DateTime<Utc>,
    },
    EntityCreated {
        name: String,
        at: DateTime<Utc>,
    },
}

impl RollbackAction {
    /// The affected target, for diagnostics
    pub fn target(&self) -> String {
        match self {
            Self::FileCreated { path, .. } | Self::FileModified { path, .. } => {
                path.display().to_string()
            }
            Self::EntityCreated { name, .. } => name.clone(),
        }
    }
}

/// Clonable handle appending to a run's action log
#[derive(Clone, Default)]
pub struct RollbackRecorder {
    actions: Arc<Mutex<Vec<RollbackAction>>>,
}

impl RollbackRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, action: RollbackAction) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    pub fn file_created(&self, path: impl Into<PathBuf>) {
        self.push(RollbackAction::FileCreated {
            path: path.into(),
            at: Utc::now(),
        });
    }

    pub fn file_modified(&self, path: impl Into<PathBuf>, previous: String) {
        self.push(RollbackAction::FileModified {
            path: path.into(),
            previous,
            at: Utc::now(),
        });
    }

    pub fn entity_created(&self, name: impl Into<String>) {
        self.push(RollbackAction::EntityCreated {
            name: name.into(),
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current log, oldest first
    pub fn snapshot(&self) -> Vec<RollbackAction> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Result of replaying an action log
#[derive(Debug, Default, Clone, Serialize)]
pub struct RollbackOutcome {
    /// Targets undone, in attempt order (reverse of recording order)
    pub undone: Vec<String>,
    /// Targets that failed to undo, with the error
    pub failed: Vec<(String, String)>,
}

impl RollbackOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Undo recorded actions strictly newest-first. Each undo is isolated: a
/// failure is recorded and the remaining actions are still attempted.
pub fn rollback(actions: &[RollbackAction], store: &KnowledgeStore) -> RollbackOutcome {
    let mut outcome = RollbackOutcome::default();

    for action in actions.iter().rev() {
        let target = action.target();
        let result = undo(action, store);
        match result {
            Ok(()) => {
                tracing::debug!(target = %target, "Rolled back action");
                outcome.undone.push(target);
            }
            Err(message) => {
                tracing::warn!(target = %target, error = %message, "Rollback action failed");
                outcome.failed.push((target, message));
            }
        }
    }

    outcome
}

fn undo(action: &RollbackAction, store: &KnowledgeStore) -> Result<(), String> {
    match action {
        RollbackAction::FileCreated { path, .. } => {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| e.to_string())
            } else {
                // Nothing left to delete
                Ok(())
            }
        }
        RollbackAction::FileModified { path, previous, .. } => {
            std::fs::write(path, previous).map_err(|e| e.to_string())
        }
        RollbackAction::EntityCreated { name, .. } => store
            .remove_entity(name)
            .map(|_| ())
            .map_err(|e| e.to_string()),
    }
}
