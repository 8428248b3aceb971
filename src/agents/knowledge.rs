//! Knowledge graph agent

use super::{AgentError, AgentResult, Operation, OperationContext};
use async_trait::async_trait;
use serde_json::{Value, json};

/// `knowledge-graph.record_insights`: derives entities from a prior step's
/// history result and persists them, recording an entity-created rollback
/// action for every entity that did not already exist.
///
/// Parameters: `source` (typically `{{collect-history}}`), optional
/// `significance` override.
#[derive(Debug)]
pub struct RecordInsights;

#[async_trait]
impl Operation for RecordInsights {
    async fn call(&self, ctx: OperationContext) -> AgentResult {
        let source = ctx.params.get("source").cloned().unwrap_or(Value::Null);

        let repository = source
            .get("repository")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let commits = source
            .get("commits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let authors: Vec<String> = source
            .get("authors")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut entities = Vec::new();
        let mut relations = Vec::new();

        let repo_entity = repository_entity_name(&repository);
        if let Some(ref repo_name) = repo_entity {
            let observation = source
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("analyzed repository")
                .to_string();
            persist(&ctx, repo_name, "repository", &[observation.clone()])?;
            entities.push(json!({
                "name": repo_name,
                "entity_type": "repository",
                "observations": [observation],
            }));
        }

        for author in &authors {
            let name = to_pascal_case(author);
            if name.is_empty() {
                continue;
            }
            let authored = commits
                .iter()
                .filter(|c| c.get("author").and_then(Value::as_str) == Some(author.as_str()))
                .count();
            let observation = format!("authored {authored} commit(s)");
            persist(&ctx, &name, "contributor", &[observation.clone()])?;
            entities.push(json!({
                "name": name,
                "entity_type": "contributor",
                "observations": [observation],
            }));
            if let Some(ref repo_name) = repo_entity {
                relations.push(json!({
                    "from": name,
                    "to": repo_name,
                    "relation": "contributes-to",
                }));
            }
        }

        let significance = ctx
            .params
            .get("significance")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| (commits.len() as i64).clamp(1, 10));

        let count = entities.len();
        tracing::debug!(entities = count, "Recorded insights");

        Ok(json!({
            "entities": entities,
            "relations": relations,
            "significance": significance,
            "count": count,
        }))
    }
}

fn persist(
    ctx: &OperationContext,
    name: &str,
    entity_type: &str,
    observations: &[String],
) -> Result<(), AgentError> {
    let created = ctx
        .store
        .upsert_entity(name, entity_type, observations)
        .map_err(|e| AgentError::Store(e.to_string()))?;
    if created {
        ctx.actions.entity_created(name);
    }
    Ok(())
}

fn repository_entity_name(repository: &str) -> Option<String> {
    let base = std::path::Path::new(repository)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(repository);
    let name = to_pascal_case(base);
    (!name.is_empty()).then_some(name)
}

fn to_pascal_case(raw: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::ParamMap;
    use crate::store::KnowledgeStore;
    use crate::workflow::RollbackRecorder;
    use std::sync::Arc;

    fn ctx_with(params: ParamMap, store: Arc<KnowledgeStore>) -> OperationContext {
        OperationContext {
            params,
            cancel: CancellationToken::new(),
            actions: RollbackRecorder::new(),
            store,
        }
    }

    fn history_source() -> Value {
        json!({
            "repository": "/work/my-repo",
            "summary": "2 commits by 2 author(s)",
            "authors": ["alice smith", "bob"],
            "commits": [
                {"hash": "abc", "author": "alice smith", "subject": "one"},
                {"hash": "def", "author": "bob", "subject": "two"},
            ],
        })
    }

    #[test]
    fn test_to_pascal_case() {
        assert_eq!(to_pascal_case("alice smith"), "AliceSmith");
        assert_eq!(to_pascal_case("my-repo"), "MyRepo");
        assert_eq!(to_pascal_case("already"), "Already");
        assert_eq!(to_pascal_case("__"), "");
    }

    #[tokio::test]
    async fn test_record_insights_persists_entities() {
        let store = Arc::new(KnowledgeStore::in_memory().unwrap());
        let mut params = ParamMap::new();
        params.insert("source".into(), history_source());
        let context = ctx_with(params, store.clone());
        let recorder = context.actions.clone();

        let result = RecordInsights.call(context).await.unwrap();

        assert_eq!(result["count"], json!(3));
        assert!(store.entity("MyRepo").unwrap().is_some());
        assert!(store.entity("AliceSmith").unwrap().is_some());
        assert!(store.entity("Bob").unwrap().is_some());
        // One rollback action per newly created entity
        assert_eq!(recorder.len(), 3);
        assert_eq!(result["relations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_existing_entities_are_not_rerecorded() {
        let store = Arc::new(KnowledgeStore::in_memory().unwrap());
        store.upsert_entity("Bob", "contributor", &[]).unwrap();

        let mut params = ParamMap::new();
        params.insert("source".into(), history_source());
        let context = ctx_with(params, store);
        let recorder = context.actions.clone();

        RecordInsights.call(context).await.unwrap();

        // Bob already existed, so only MyRepo and AliceSmith are undoable
        assert_eq!(recorder.len(), 2);
    }

    #[tokio::test]
    async fn test_null_source_yields_no_entities() {
        let store = Arc::new(KnowledgeStore::in_memory().unwrap());
        let context = ctx_with(ParamMap::new(), store);

        let result = RecordInsights.call(context).await.unwrap();
        // The quality gate is responsible for rejecting this
        assert_eq!(result["count"], json!(0));
    }

    #[tokio::test]
    async fn test_significance_override() {
        let store = Arc::new(KnowledgeStore::in_memory().unwrap());
        let mut params = ParamMap::new();
        params.insert("source".into(), history_source());
        params.insert("significance".into(), json!(9));
        let context = ctx_with(params, store);

        let result = RecordInsights.call(context).await.unwrap();
        assert_eq!(result["significance"], json!(9));
    }
}
