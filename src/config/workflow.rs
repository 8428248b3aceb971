//! Workflow and step definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter maps passed to agent operations and declared on steps
pub type ParamMap = serde_json::Map<String, Value>;

/// Default per-step deadline when a step declares none
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

/// One unit of work bound to an agent capability
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Step name (unique within a workflow)
    pub name: String,

    /// Target agent name
    pub agent: String,

    /// Target operation name on that agent
    pub operation: String,

    /// Declared parameters; string values of shape `{{step.field}}` are
    /// resolved against prior step results at execution time
    #[serde(default)]
    pub params: ParamMap,

    /// Steps whose results must exist and be error-free before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Per-step timeout in seconds
    pub timeout: Option<u64>,

    #[serde(default)]
    pub description: String,
}

impl StepConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS)
    }
}

/// Thresholds consumed by the quality gate
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QualityThresholds {
    /// Default and minimum acceptable significance score (1-10)
    #[serde(default = "default_min_significance")]
    pub min_significance: i64,

    /// Minimum character count for generated documents
    #[serde(default = "default_min_report_chars")]
    pub min_report_chars: usize,

    /// Minimum entity count for knowledge-graph results
    #[serde(default = "default_min_entities")]
    pub min_entities: usize,
}

fn default_min_significance() -> i64 {
    5
}

fn default_min_report_chars() -> usize {
    200
}

fn default_min_entities() -> usize {
    1
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_significance: default_min_significance(),
            min_report_chars: default_min_report_chars(),
            min_entities: default_min_entities(),
        }
    }
}

/// Per-workflow execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSettings {
    /// Run quality validation after each step
    #[serde(default = "default_true")]
    pub qa_validation: bool,

    /// Record a failing step instead of aborting once retries are exhausted
    #[serde(default)]
    pub allow_partial_completion: bool,

    /// Maximum attempts per step, shared by operation and quality failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Overall wall-clock budget for a run, in seconds
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,

    /// Declared concurrency limit; execution is sequential-only (validated,
    /// never used for dispatch)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_steps: u32,

    #[serde(default)]
    pub quality: QualityThresholds,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_duration() -> u64 {
    600
}

fn default_max_concurrent() -> u32 {
    1
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            qa_validation: default_true(),
            allow_partial_completion: false,
            max_retries: default_max_retries(),
            max_duration: default_max_duration(),
            max_concurrent_steps: default_max_concurrent(),
            quality: QualityThresholds::default(),
        }
    }
}

/// A named, ordered list of steps with shared settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub settings: WorkflowSettings,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl WorkflowConfig {
    /// Validate the definition.
    ///
    /// The declared step order must already be a valid topological order:
    /// a step may only depend on steps declared before it. Definitions that
    /// violate their own dependency edges are rejected here, at registration
    /// time, rather than trusted at run time.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("workflow name is empty".to_string());
        }
        if self.steps.is_empty() {
            errors.push("workflow has no steps".to_string());
        }
        if self.settings.max_concurrent_steps == 0 {
            errors.push("max_concurrent_steps must be at least 1".to_string());
        }

        let mut seen_names = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen_names.insert(step.name.as_str()) {
                errors.push(format!("duplicate step name: {}", step.name));
            }
            if step.agent.trim().is_empty() || step.operation.trim().is_empty() {
                errors.push(format!(
                    "step '{}' must name both an agent and an operation",
                    step.name
                ));
            }
            if step.timeout == Some(0) {
                errors.push(format!("step '{}' has a zero timeout", step.name));
            }
        }

        let all_names: std::collections::HashSet<_> =
            self.steps.iter().map(|s| s.name.as_str()).collect();
        let mut declared_before = std::collections::HashSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !all_names.contains(dep.as_str()) {
                    errors.push(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ));
                } else if !declared_before.contains(dep.as_str()) {
                    errors.push(format!(
                        "step '{}' is declared before its dependency '{}'",
                        step.name, dep
                    ));
                }
            }
            declared_before.insert(step.name.as_str());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, deps: &[&str]) -> StepConfig {
        StepConfig {
            name: name.into(),
            agent: "git-history".into(),
            operation: "collect_commits".into(),
            params: ParamMap::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            description: String::new(),
        }
    }

    #[test]
    fn test_step_config_from_toml() {
        let toml = r#"
            name = "collect-history"
            agent = "git-history"
            operation = "collect_commits"
            timeout = 120

            [params]
            depth = 50
        "#;
        let step: StepConfig = toml::from_str(toml).unwrap();
        assert_eq!(step.name, "collect-history");
        assert_eq!(step.agent, "git-history");
        assert_eq!(step.timeout_secs(), 120);
        assert_eq!(step.params.get("depth"), Some(&json!(50)));
    }

    #[test]
    fn test_workflow_config_from_toml() {
        let toml = r#"
            name = "nightly"
            description = "Nightly sweep"

            [settings]
            max_retries = 2
            allow_partial_completion = true

            [[steps]]
            name = "collect"
            agent = "git-history"
            operation = "collect_commits"

            [[steps]]
            name = "report"
            agent = "documentation"
            operation = "generate_report"
            depends_on = ["collect"]

            [steps.params]
            history = "{{collect}}"
        "#;
        let workflow: WorkflowConfig = toml::from_str(toml).unwrap();
        assert_eq!(workflow.name, "nightly");
        assert_eq!(workflow.settings.max_retries, 2);
        assert!(workflow.settings.allow_partial_completion);
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps[1].depends_on, vec!["collect"]);
        workflow.validate().unwrap();
    }

    #[test]
    fn test_default_settings() {
        let settings = WorkflowSettings::default();
        assert!(settings.qa_validation);
        assert!(!settings.allow_partial_completion);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.max_duration, 600);
        assert_eq!(settings.max_concurrent_steps, 1);
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let workflow = WorkflowConfig {
            name: "dup".into(),
            steps: vec![step("a", &[]), step("a", &[])],
            ..Default::default()
        };
        let errors = workflow.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate step name")));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let workflow = WorkflowConfig {
            name: "unknown".into(),
            steps: vec![step("a", &["ghost"])],
            ..Default::default()
        };
        let errors = workflow.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unknown step 'ghost'")));
    }

    #[test]
    fn test_validate_rejects_forward_dependency() {
        // b is declared first but depends on a, declared later
        let workflow = WorkflowConfig {
            name: "order".into(),
            steps: vec![step("b", &["a"]), step("a", &[])],
            ..Default::default()
        };
        let errors = workflow.validate().unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| e.contains("declared before its dependency"))
        );
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let workflow = WorkflowConfig {
            name: "selfie".into(),
            steps: vec![step("a", &["a"])],
            ..Default::default()
        };
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_workflow() {
        let workflow = WorkflowConfig {
            name: "empty".into(),
            ..Default::default()
        };
        assert!(workflow.validate().is_err());
    }
}
