//! Quality gate: step-result validation, auto-correction, retry synthesis

use crate::config::{ParamMap, QualityThresholds, StepConfig};
use crate::store::KnowledgeStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Verdict for one evaluation of a step result
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub step: String,
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether auto-correction repaired the payload
    pub corrected: bool,
    /// Replacement payload when corrected
    pub corrected_value: Option<Value>,
    pub evaluated_at: DateTime<Utc>,
}

/// Runs check families keyed by the step's agent, with bounded deterministic
/// auto-correction for minor defects.
pub struct QualityGate {
    thresholds: QualityThresholds,
    store: Option<Arc<KnowledgeStore>>,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            store: None,
        }
    }

    /// Cross-check knowledge-graph results against the persisted store
    pub fn with_store(mut self, store: Arc<KnowledgeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn evaluate(&self, step: &StepConfig, result: &Value) -> QualityReport {
        let (mut errors, warnings) = self.check(&step.agent, result);

        let mut corrected = false;
        let mut corrected_value = None;

        // Repair only when every error class is correctable; a partial repair
        // would still fail and just obscure the original payload.
        if !errors.is_empty() && errors.iter().all(|e| is_correctable(e)) {
            let mut fixed = result.clone();
            for error in &errors {
                apply_correction(&mut fixed, error, &self.thresholds);
            }
            let (remaining, _) = self.check(&step.agent, &fixed);
            if remaining.is_empty() {
                tracing::info!(step = %step.name, repaired = errors.len(), "Auto-corrected step result");
                corrected = true;
                corrected_value = Some(fixed);
                errors.clear();
            }
        }

        QualityReport {
            step: step.name.clone(),
            passed: errors.is_empty(),
            errors,
            warnings,
            corrected,
            corrected_value,
            evaluated_at: Utc::now(),
        }
    }

    fn check(&self, agent: &str, result: &Value) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        match agent {
            "git-history" => self.check_git_history(result, &mut errors, &mut warnings),
            "knowledge-graph" => self.check_knowledge_graph(result, &mut errors, &mut warnings),
            "documentation" => self.check_documentation(result, &mut errors, &mut warnings),
            _ => {
                // Unknown agents get structural checks only
                if !result.is_object() {
                    errors.push("result is not a structured object".to_string());
                }
            }
        }
        (errors, warnings)
    }

    fn check_git_history(&self, result: &Value, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        let commits = result.get("commits").and_then(Value::as_array);
        match commits {
            Some(commits) if !commits.is_empty() => {
                if let Some(count) = result.get("count").and_then(Value::as_u64) {
                    if count as usize != commits.len() {
                        warnings.push(format!(
                            "commit count {} does not match the commits list ({})",
                            count,
                            commits.len()
                        ));
                    }
                }
            }
            _ => errors.push("no commits identified in the history window".to_string()),
        }

        let summary_len = result
            .get("summary")
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or(0);
        if summary_len < 20 {
            errors.push("history summary too short to be useful".to_string());
        }
    }

    fn check_knowledge_graph(
        &self,
        result: &Value,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let entities = result
            .get("entities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if entities.len() < self.thresholds.min_entities {
            errors.push(format!(
                "insufficient entities: {} < {}",
                entities.len(),
                self.thresholds.min_entities
            ));
        }
        for entity in &entities {
            if let Some(name) = entity.get("name").and_then(Value::as_str) {
                if name != pascal_case(name) {
                    errors.push(format!("entity name '{name}' is not PascalCase"));
                }
            }
        }

        if result.get("relations").and_then(Value::as_array).is_none() {
            errors.push("missing relations list".to_string());
        }

        match result.get("significance").and_then(Value::as_i64) {
            None => errors.push("missing significance score".to_string()),
            Some(s) if s < self.thresholds.min_significance => warnings.push(format!(
                "low significance score: {} < {}",
                s, self.thresholds.min_significance
            )),
            Some(_) => {}
        }

        // Entities the step claims to have produced should be findable in
        // the knowledge store
        if let Some(ref store) = self.store {
            for entity in &entities {
                let Some(name) = entity.get("name").and_then(Value::as_str) else {
                    continue;
                };
                match store.entity(name) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warnings.push(format!("entity '{name}' was not persisted to the store"))
                    }
                    Err(error) => {
                        warnings.push(format!("store lookup failed for '{name}': {error}"))
                    }
                }
            }
        }
    }

    fn check_documentation(
        &self,
        result: &Value,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let document = result.get("document").and_then(Value::as_str);
        match document {
            None => errors.push("missing generated document".to_string()),
            Some(doc) => {
                if doc.len() < self.thresholds.min_report_chars {
                    errors.push(format!(
                        "document below minimum length ({} < {})",
                        doc.len(),
                        self.thresholds.min_report_chars
                    ));
                }
                if doc.contains("{{") {
                    errors.push("unresolved placeholder markers remain in the document".to_string());
                }
                if !doc.contains("Cross-references:") {
                    errors.push("missing cross-reference annotation".to_string());
                }
            }
        }
        if result.get("path").and_then(Value::as_str).is_none() {
            warnings.push("report path missing from result".to_string());
        }
    }
}

/// Error classes the gate may repair deterministically. Everything else
/// (empty history, hollow documents, unresolved placeholders) needs a retry.
fn is_correctable(error: &str) -> bool {
    error.contains("missing significance score")
        || error.contains("is not PascalCase")
        || error.contains("missing relations list")
        || error.contains("missing cross-reference annotation")
}

fn apply_correction(value: &mut Value, error: &str, thresholds: &QualityThresholds) {
    if error.contains("missing significance score") {
        if let Some(map) = value.as_object_mut() {
            map.insert("significance".into(), json!(thresholds.min_significance));
        }
    } else if error.contains("missing relations list") {
        if let Some(map) = value.as_object_mut() {
            map.insert("relations".into(), json!([]));
        }
    } else if error.contains("is not PascalCase") {
        if let Some(entities) = value.get_mut("entities").and_then(Value::as_array_mut) {
            for entity in entities {
                let normalized = entity
                    .get("name")
                    .and_then(Value::as_str)
                    .map(pascal_case);
                if let Some(name) = normalized {
                    entity["name"] = json!(name);
                }
            }
        }
    } else if error.contains("missing cross-reference annotation") {
        let amended = value
            .get("document")
            .and_then(Value::as_str)
            .map(|doc| format!("{}\nCross-references: none\n", doc.trim_end()));
        if let Some(amended) = amended {
            if let Some(map) = value.as_object_mut() {
                map.insert("length".into(), json!(amended.len()));
                map.insert("document".into(), json!(amended));
            }
        }
    }
}

fn pascal_case(raw: &str) -> String {
    raw.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Build the next attempt's parameters from the failures so far: map known
/// error patterns to additive hints and attach a feedback block carrying the
/// attempt number, every prior error, and the timeout multiplier the engine
/// grants this attempt.
pub fn enhance_retry_parameters(params: &mut ParamMap, history: &[QualityReport], attempt: u32) {
    let mut guidance: Vec<&str> = Vec::new();

    if let Some(last) = history.last() {
        for error in &last.errors {
            let lowered = error.to_lowercase();
            if lowered.contains("no commits") || lowered.contains("insufficient") {
                params.insert("deep_analysis".into(), json!(true));
                let depth = params.get("depth").and_then(Value::as_u64).unwrap_or(50);
                params.insert("depth".into(), json!(depth.saturating_mul(2)));
                guidance.push("widen the history window and analyze more deeply");
            } else if lowered.contains("placeholder") {
                params.insert("use_defaults".into(), json!(true));
                guidance.push("substitute defaults for unresolved inputs");
            } else if lowered.contains("pascalcase") || lowered.contains("entit") {
                params.insert("relaxed_validation".into(), json!(true));
                guidance.push("regenerate entities with normalized names");
            } else if lowered.contains("too short") || lowered.contains("minimum length") {
                params.insert("verbose".into(), json!(true));
                guidance.push("produce a more detailed result");
            }
        }
    }
    guidance.dedup();

    let previous_errors: Vec<String> = history
        .iter()
        .flat_map(|report| report.errors.iter().cloned())
        .collect();

    params.insert(
        "retry_feedback".into(),
        json!({
            "attempt": attempt,
            "previous_errors": previous_errors,
            "timeout_multiplier": attempt,
            "guidance": guidance,
        }),
    );
}
