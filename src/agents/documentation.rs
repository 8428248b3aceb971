//! Analysis report agent

use super::{AgentError, AgentResult, Operation, OperationContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;

/// `documentation.generate_report`: renders a markdown analysis report to
/// disk, recording a file-created or file-modified rollback action.
///
/// Parameters: `title`, `history` (typically `{{collect-history}}`),
/// `insights` (typically `{{record-insights}}`), `output_dir`.
#[derive(Debug)]
pub struct GenerateReport;

#[async_trait]
impl Operation for GenerateReport {
    async fn call(&self, ctx: OperationContext) -> AgentResult {
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let title = ctx.str_param("title").unwrap_or("Analysis report").to_string();
        let history = ctx.params.get("history").cloned().unwrap_or(Value::Null);
        let insights = ctx.params.get("insights").cloned().unwrap_or(Value::Null);

        let output_dir = ctx
            .str_param("output_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("quarry").join("reports"));
        std::fs::create_dir_all(&output_dir)?;

        let document = render(&title, &history, &insights);

        let filename = format!(
            "{}-{}.md",
            slug(&title),
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = output_dir.join(filename);

        if path.exists() {
            let previous = std::fs::read_to_string(&path)?;
            ctx.actions.file_modified(&path, previous);
        } else {
            ctx.actions.file_created(&path);
        }
        std::fs::write(&path, &document)?;

        let length = document.len();
        tracing::debug!(path = %path.display(), bytes = length, "Wrote analysis report");

        Ok(json!({
            "title": title,
            "path": path.display().to_string(),
            "document": document,
            "length": length,
        }))
    }
}

fn render(title: &str, history: &Value, insights: &Value) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# {title}\n\n"));
    doc.push_str(&format!("Generated: {}\n\n", chrono::Utc::now().to_rfc3339()));

    doc.push_str("## History\n\n");
    match history.get("summary").and_then(Value::as_str) {
        Some(summary) => doc.push_str(&format!("{summary}\n\n")),
        None => doc.push_str("No history was available for this run.\n\n"),
    }
    if let Some(commits) = history.get("commits").and_then(Value::as_array) {
        for commit in commits.iter().take(10) {
            let hash = commit.get("hash").and_then(Value::as_str).unwrap_or("");
            let subject = commit.get("subject").and_then(Value::as_str).unwrap_or("");
            let author = commit.get("author").and_then(Value::as_str).unwrap_or("");
            let short = &hash[..hash.len().min(8)];
            doc.push_str(&format!("- `{short}` {subject} ({author})\n"));
        }
        doc.push('\n');
    }

    doc.push_str("## Insights\n\n");
    let entity_names = entity_names(insights);
    if entity_names.is_empty() {
        doc.push_str("No entities were recorded for this run.\n\n");
    } else {
        for entity in insights
            .get("entities")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let name = entity.get("name").and_then(Value::as_str).unwrap_or("");
            let kind = entity
                .get("entity_type")
                .and_then(Value::as_str)
                .unwrap_or("entity");
            doc.push_str(&format!("- **{name}** ({kind})\n"));
        }
        doc.push('\n');
    }
    if let Some(significance) = insights.get("significance").and_then(Value::as_i64) {
        doc.push_str(&format!("Significance: {significance}/10\n\n"));
    }

    if entity_names.is_empty() {
        doc.push_str("Cross-references: none\n");
    } else {
        doc.push_str(&format!("Cross-references: {}\n", entity_names.join(", ")));
    }

    doc
}

fn entity_names(insights: &Value) -> Vec<String> {
    insights
        .get("entities")
        .and_then(Value::as_array)
        .map(|entities| {
            entities
                .iter()
                .filter_map(|e| e.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn slug(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "report".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::ParamMap;
    use crate::store::KnowledgeStore;
    use crate::workflow::{RollbackAction, RollbackRecorder};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx(params: ParamMap) -> OperationContext {
        OperationContext {
            params,
            cancel: CancellationToken::new(),
            actions: RollbackRecorder::new(),
            store: Arc::new(KnowledgeStore::in_memory().unwrap()),
        }
    }

    fn params_for(dir: &TempDir) -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("title".into(), json!("Weekly sweep"));
        params.insert(
            "output_dir".into(),
            json!(dir.path().display().to_string()),
        );
        params.insert(
            "history".into(),
            json!({
                "summary": "3 commits by 1 author(s) in repo",
                "commits": [
                    {"hash": "abcdef1234", "author": "Tester", "subject": "fix bug"},
                ],
            }),
        );
        params.insert(
            "insights".into(),
            json!({
                "entities": [{"name": "MyRepo", "entity_type": "repository"}],
                "significance": 7,
            }),
        );
        params
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Weekly sweep!"), "weekly-sweep");
        assert_eq!(slug("???"), "report");
    }

    #[tokio::test]
    async fn test_generate_report_writes_file() {
        let dir = TempDir::new().unwrap();
        let context = ctx(params_for(&dir));
        let recorder = context.actions.clone();

        let result = GenerateReport.call(context).await.unwrap();

        let path = PathBuf::from(result["path"].as_str().unwrap());
        assert!(path.exists());

        let document = result["document"].as_str().unwrap();
        assert!(document.contains("# Weekly sweep"));
        assert!(document.contains("`abcdef12` fix bug"));
        assert!(document.contains("Cross-references: MyRepo"));
        assert!(document.contains("Significance: 7/10"));

        let log = recorder.snapshot();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], RollbackAction::FileCreated { .. }));
    }

    #[tokio::test]
    async fn test_generate_report_without_inputs() {
        let dir = TempDir::new().unwrap();
        let mut params = ParamMap::new();
        params.insert(
            "output_dir".into(),
            json!(dir.path().display().to_string()),
        );

        let result = GenerateReport.call(ctx(params)).await.unwrap();
        let document = result["document"].as_str().unwrap();
        assert!(document.contains("No history was available"));
        assert!(document.contains("Cross-references: none"));
    }

    #[tokio::test]
    async fn test_cancelled_before_writing() {
        let dir = TempDir::new().unwrap();
        let context = ctx(params_for(&dir));
        context.cancel.cancel();
        let recorder = context.actions.clone();

        let err = GenerateReport.call(context).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(recorder.is_empty());
    }
}
