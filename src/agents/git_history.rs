//! Git history collection agent

use super::{AgentError, AgentResult, Operation, OperationContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::process::Command;

const DEFAULT_DEPTH: u64 = 20;
const MAX_DEPTH: u64 = 500;

/// `git-history.collect_commits`: walks `git log` in the target repository.
///
/// Parameters: `repository` (default `.`), `depth` (default 20, capped at
/// 500), `since` (history floor; falls back to the engine-injected
/// `checkpoint` so incremental workflows only see new commits).
#[derive(Debug)]
pub struct CollectCommits;

#[async_trait]
impl Operation for CollectCommits {
    async fn call(&self, ctx: OperationContext) -> AgentResult {
        let repository = ctx.str_param("repository").unwrap_or(".").to_string();
        let depth = ctx
            .u64_param("depth")
            .unwrap_or(DEFAULT_DEPTH)
            .clamp(1, MAX_DEPTH);
        let since = ctx
            .str_param("since")
            .or_else(|| ctx.str_param("checkpoint"))
            .map(str::to_string);

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&repository)
            .arg("log")
            .arg(format!("-n{depth}"))
            .arg("--date=iso-strict")
            // Unit separator between fields, one commit per line
            .arg("--pretty=format:%H%x1f%an%x1f%ad%x1f%s")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref floor) = since {
            cmd.arg(format!("--since={floor}"));
        }

        let mut cancel = ctx.cancel.clone();
        let output = tokio::select! {
            output = cmd.output() => {
                output.map_err(|e| AgentError::Failed(format!("failed to run git: {e}")))?
            }
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Failed(format!(
                "git log failed in '{}': {}",
                repository,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let commits = parse_commits(&stdout);
        let count = commits.len();
        let authors = distinct_authors(&commits);
        let summary = summarize(&repository, &commits, &authors, since.as_deref());

        tracing::debug!(repository = %repository, commits = count, "Collected commit history");

        Ok(json!({
            "repository": repository,
            "commits": commits,
            "count": count,
            "authors": authors,
            "since": since,
            "summary": summary,
        }))
    }
}

fn parse_commits(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split('\u{1f}');
            let hash = fields.next()?;
            let author = fields.next()?;
            let date = fields.next()?;
            let subject = fields.next().unwrap_or("");
            if hash.is_empty() {
                return None;
            }
            Some(json!({
                "hash": hash,
                "author": author,
                "date": date,
                "subject": subject,
            }))
        })
        .collect()
}

fn distinct_authors(commits: &[Value]) -> Vec<String> {
    let mut authors: Vec<String> = commits
        .iter()
        .filter_map(|c| c.get("author").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    authors.sort_unstable();
    authors.dedup();
    authors
}

fn summarize(
    repository: &str,
    commits: &[Value],
    authors: &[String],
    since: Option<&str>,
) -> String {
    if commits.is_empty() {
        return match since {
            Some(floor) => format!("No commits found in {repository} since {floor}"),
            None => format!("No commits found in the history of {repository}"),
        };
    }
    let latest = commits
        .first()
        .and_then(|c| c.get("subject").and_then(Value::as_str))
        .unwrap_or("(no subject)");
    format!(
        "{} commits by {} author(s) in {}; most recent: {}",
        commits.len(),
        authors.len(),
        repository,
        latest
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::ParamMap;
    use crate::store::KnowledgeStore;
    use crate::workflow::RollbackRecorder;
    use serde_json::json;
    use std::path::Path;
    use std::process::Command as StdCommand;
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

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Tester")
            .env("GIT_AUTHOR_EMAIL", "tester@example.com")
            .env("GIT_COMMITTER_NAME", "Tester")
            .env("GIT_COMMITTER_EMAIL", "tester@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn seed_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        std::fs::write(dir.join("one.txt"), "one").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "add one"]);
        std::fs::write(dir.join("two.txt"), "two").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-q", "-m", "add two"]);
    }

    #[test]
    fn test_parse_commits() {
        let raw = "abc\u{1f}Alice\u{1f}2026-01-01T00:00:00+00:00\u{1f}fix parser\n\
                   def\u{1f}Bob\u{1f}2026-01-02T00:00:00+00:00\u{1f}add feature";
        let commits = parse_commits(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0]["author"], json!("Alice"));
        assert_eq!(commits[1]["subject"], json!("add feature"));
    }

    #[test]
    fn test_summary_mentions_window_when_empty() {
        let summary = summarize("repo", &[], &[], Some("2026-08-01T00:00:00Z"));
        assert!(summary.contains("since 2026-08-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_collect_from_real_repo() {
        let dir = TempDir::new().unwrap();
        seed_repo(dir.path());

        let mut params = ParamMap::new();
        params.insert(
            "repository".into(),
            json!(dir.path().display().to_string()),
        );
        params.insert("depth".into(), json!(10));

        let result = CollectCommits.call(ctx(params)).await.unwrap();
        assert_eq!(result["count"], json!(2));
        assert_eq!(result["authors"], json!(["Tester"]));
        assert!(
            result["summary"]
                .as_str()
                .unwrap()
                .contains("2 commits")
        );
    }

    #[tokio::test]
    async fn test_collect_from_missing_repo_fails() {
        let mut params = ParamMap::new();
        params.insert("repository".into(), json!("/definitely/not/a/repo"));

        let err = CollectCommits.call(ctx(params)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let dir = TempDir::new().unwrap();
        seed_repo(dir.path());

        let mut params = ParamMap::new();
        params.insert(
            "repository".into(),
            json!(dir.path().display().to_string()),
        );
        let context = ctx(params);
        context.cancel.cancel();

        // Cancellation may win the race before git produces output
        match CollectCommits.call(context).await {
            Err(AgentError::Cancelled) | Ok(_) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
