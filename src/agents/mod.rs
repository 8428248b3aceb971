//! Agent capabilities and their registry
//!
//! Agents are opaque collaborators: each exposes named operations of shape
//! `operation(parameters) -> result`. The engine resolves `(agent, operation)`
//! pairs against trait objects registered once at startup; there is no
//! call-time reflection beyond that single lookup.

mod documentation;
mod git_history;
mod knowledge;

pub use documentation::GenerateReport;
pub use git_history::CollectCommits;
pub use knowledge::RecordInsights;

use crate::cancel::CancellationToken;
use crate::config::ParamMap;
use crate::store::KnowledgeStore;
use crate::workflow::RollbackRecorder;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors an operation can surface to the engine
#[derive(Debug, Error)]
pub enum AgentError {
    /// The operation observed its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// The supplied parameters cannot be used; retrying will not help
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The operation ran and failed; a retry may succeed
    #[error("operation failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl AgentError {
    /// Whether the engine should spend retry budget on this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Io(_) | Self::Store(_))
    }
}

pub type AgentResult = Result<Value, AgentError>;

/// Everything an operation invocation receives from the engine
pub struct OperationContext {
    /// Resolved parameters (step-declared, caller-supplied, templates applied)
    pub params: ParamMap,

    /// Triggered by the engine on deadline expiry or interrupt
    pub cancel: CancellationToken,

    /// Side-effect log for the owning run
    pub actions: RollbackRecorder,

    pub store: Arc<KnowledgeStore>,
}

impl OperationContext {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// A named unit of work an agent exposes
#[async_trait]
pub trait Operation: Send + Sync + std::fmt::Debug {
    async fn call(&self, ctx: OperationContext) -> AgentResult;
}

/// Failure to resolve a capability; lists what is available instead
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("unknown agent '{agent}' (available: {})", available.join(", "))]
    UnknownAgent {
        agent: String,
        available: Vec<String>,
    },

    #[error("agent '{agent}' has no operation '{operation}' (available: {})", available.join(", "))]
    UnknownOperation {
        agent: String,
        operation: String,
        available: Vec<String>,
    },
}

/// Maps `(agent, operation)` to registered trait objects
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, HashMap<String, Arc<dyn Operation>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in agents
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("git-history", "collect_commits", Arc::new(CollectCommits));
        registry.register("knowledge-graph", "record_insights", Arc::new(RecordInsights));
        registry.register("documentation", "generate_report", Arc::new(GenerateReport));
        registry
    }

    pub fn register(&mut self, agent: &str, operation: &str, op: Arc<dyn Operation>) {
        self.agents
            .entry(agent.to_string())
            .or_default()
            .insert(operation.to_string(), op);
    }

    pub fn resolve(
        &self,
        agent: &str,
        operation: &str,
    ) -> Result<Arc<dyn Operation>, CapabilityError> {
        let Some(operations) = self.agents.get(agent) else {
            return Err(CapabilityError::UnknownAgent {
                agent: agent.to_string(),
                available: self.agent_names(),
            });
        };
        operations.get(operation).cloned().ok_or_else(|| {
            let mut available: Vec<_> = operations.keys().cloned().collect();
            available.sort_unstable();
            CapabilityError::UnknownOperation {
                agent: agent.to_string(),
                operation: operation.to_string(),
                available,
            }
        })
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.agents.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn operations(&self, agent: &str) -> Vec<String> {
        let mut names: Vec<_> = self
            .agents
            .get(agent)
            .map(|ops| ops.keys().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Total registered (agent, operation) pairs
    pub fn capability_count(&self) -> usize {
        self.agents.values().map(HashMap::len).sum()
    }
}
