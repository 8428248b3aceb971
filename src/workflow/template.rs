//! Parameter template resolution
//!
//! A declared parameter whose string value has the exact shape
//! `{{step}}` or `{{step.field.path}}` is replaced in place by the referenced
//! step's stored value (or the addressed field within it). References to
//! absent or errored steps resolve to null with a logged warning; resolution
//! never fails. Nested objects are resolved recursively; arrays are not
//! traversed.

use super::execution::StepOutcome;
use crate::config::ParamMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{\s*([A-Za-z0-9_-]+)(?:\.([A-Za-z0-9_.-]+))?\s*\}\}$")
        .expect("placeholder regex is valid")
});

/// Resolve placeholders in `params` against prior step results, in place.
/// Resolving a map with no remaining placeholders is a no-op.
pub fn resolve_parameters(params: &mut ParamMap, results: &HashMap<String, StepOutcome>) {
    for (key, value) in params.iter_mut() {
        resolve_value(key, value, results);
    }
}

fn resolve_value(key: &str, value: &mut Value, results: &HashMap<String, StepOutcome>) {
    match value {
        Value::String(raw) => {
            if let Some(captures) = PLACEHOLDER.captures(raw) {
                let step = &captures[1];
                let field = captures.get(2).map(|m| m.as_str());
                *value = lookup(key, step, field, results);
            }
        }
        Value::Object(map) => {
            for (nested_key, nested) in map.iter_mut() {
                resolve_value(nested_key, nested, results);
            }
        }
        // Arrays are not traversed
        _ => {}
    }
}

fn lookup(
    key: &str,
    step: &str,
    field: Option<&str>,
    results: &HashMap<String, StepOutcome>,
) -> Value {
    let outcome = match results.get(step) {
        Some(outcome) => outcome,
        None => {
            tracing::warn!(
                param = key,
                step = step,
                "Template references a step with no stored result; resolving to null"
            );
            return Value::Null;
        }
    };

    if outcome.failed {
        tracing::warn!(
            param = key,
            step = step,
            "Template references a failed step; resolving to null"
        );
        return Value::Null;
    }

    let mut current = outcome.value.clone().unwrap_or(Value::Null);
    if let Some(path) = field {
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next.clone(),
                None => {
                    tracing::warn!(
                        param = key,
                        step = step,
                        field = path,
                        "Template field not found in step result; resolving to null"
                    );
                    return Value::Null;
                }
            }
        }
    }
    current
}
