//! Workflow registry and definition loading
//!
//! Definitions come from three layers, later layers replacing earlier ones on
//! name collision: built-in templates, TOML files in the user config
//! directory, TOML files in the project's `.quarry/workflows/`.

use super::error::ConfigError;
use super::workflow::{StepConfig, WorkflowConfig, WorkflowSettings};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Immutable collection of registered workflow definitions
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<WorkflowConfig>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in analysis workflows
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for workflow in builtin_workflows() {
            registry
                .register(workflow)
                .expect("built-in workflow failed validation");
        }
        registry
    }

    /// Validate and register a definition. A definition whose declared step
    /// order violates its own dependency edges is rejected here.
    pub fn register(&mut self, workflow: WorkflowConfig) -> Result<(), ConfigError> {
        if let Err(errors) = workflow.validate() {
            return Err(ConfigError::InvalidWorkflow {
                name: workflow.name,
                errors,
            });
        }
        tracing::debug!(workflow = %workflow.name, steps = workflow.steps.len(), "Registered workflow");
        self.workflows
            .insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowConfig>> {
        self.workflows.get(name).cloned()
    }

    /// Registered names, sorted for stable listings
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Register every `*.toml` definition under `dir`. Returns how many were
    /// loaded; a missing directory is not an error.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ConfigError> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let workflow: WorkflowConfig =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source: Box::new(source),
                })?;
            self.register(workflow)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

/// Build the registry for a process: built-ins, then user config dir, then
/// the project's `.quarry/workflows/`.
pub fn load_registry(project_dir: Option<&Path>) -> Result<WorkflowRegistry, ConfigError> {
    let mut registry = WorkflowRegistry::with_builtins();

    if let Some(user_dir) = user_workflow_dir() {
        let loaded = registry.load_dir(&user_dir)?;
        if loaded > 0 {
            tracing::info!(dir = %user_dir.display(), count = loaded, "Loaded user workflows");
        }
    }

    if let Some(project) = project_dir {
        let project_workflows = project.join(".quarry").join("workflows");
        let loaded = registry.load_dir(&project_workflows)?;
        if loaded > 0 {
            tracing::info!(dir = %project_workflows.display(), count = loaded, "Loaded project workflows");
        }
    }

    Ok(registry)
}

fn user_workflow_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("quarry").join("workflows"))
}

/// Built-in workflow templates
pub fn builtin_workflows() -> Vec<WorkflowConfig> {
    vec![
        repository_analysis(),
        incremental_analysis(),
        complete_analysis(),
    ]
}

fn history_step(depth: u64, timeout: u64) -> StepConfig {
    StepConfig {
        name: "collect-history".into(),
        agent: "git-history".into(),
        operation: "collect_commits".into(),
        params: [("depth".to_string(), json!(depth))].into_iter().collect(),
        depends_on: vec![],
        timeout: Some(timeout),
        description: "Collect commit history from the target repository".into(),
    }
}

fn insights_step(timeout: u64) -> StepConfig {
    StepConfig {
        name: "record-insights".into(),
        agent: "knowledge-graph".into(),
        operation: "record_insights".into(),
        params: [("source".to_string(), json!("{{collect-history}}"))]
            .into_iter()
            .collect(),
        depends_on: vec!["collect-history".into()],
        timeout: Some(timeout),
        description: "Derive entities from the history and persist them".into(),
    }
}

fn report_step(title: &str, timeout: u64) -> StepConfig {
    StepConfig {
        name: "generate-report".into(),
        agent: "documentation".into(),
        operation: "generate_report".into(),
        params: [
            ("title".to_string(), json!(title)),
            ("history".to_string(), json!("{{collect-history}}")),
            ("insights".to_string(), json!("{{record-insights}}")),
        ]
        .into_iter()
        .collect(),
        depends_on: vec!["collect-history".into(), "record-insights".into()],
        timeout: Some(timeout),
        description: "Render the analysis report to disk".into(),
    }
}

fn repository_analysis() -> WorkflowConfig {
    WorkflowConfig {
        name: "repository-analysis".into(),
        description: "Analyze a repository's history and persist the insights".into(),
        settings: WorkflowSettings::default(),
        steps: vec![
            history_step(50, 120),
            insights_step(90),
            report_step("Repository analysis", 60),
        ],
    }
}

fn incremental_analysis() -> WorkflowConfig {
    WorkflowConfig {
        name: "incremental-analysis".into(),
        description: "Analyze only commits since the last successful run".into(),
        settings: WorkflowSettings {
            allow_partial_completion: true,
            ..Default::default()
        },
        // The engine injects the stored checkpoint as a `checkpoint` caller
        // parameter; git-history uses it as the default history floor.
        steps: vec![
            history_step(200, 120),
            insights_step(60),
            report_step("Incremental analysis", 60),
        ],
    }
}

fn complete_analysis() -> WorkflowConfig {
    let mut settings = WorkflowSettings::default();
    settings.max_duration = 900;
    settings.quality.min_significance = 6;
    WorkflowConfig {
        name: "complete-analysis".into(),
        description: "Comprehensive analysis with strict quality thresholds".into(),
        settings,
        steps: vec![
            history_step(200, 180),
            insights_step(90),
            report_step("Complete analysis", 90),
        ],
    }
}
