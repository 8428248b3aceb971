//! SQLite-backed knowledge store
//!
//! The persistence collaborator for the whole crate: entities written by the
//! knowledge-graph agent (and removed again during rollback), per-workflow
//! resumability checkpoints, and a record of every terminal run.

use super::schema::init_schema;
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A persisted knowledge entity
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub observations: Vec<String>,
    pub created_at: String,
}

/// A terminal workflow run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub execution_id: String,
    pub workflow_name: String,
    pub success: bool,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub created_at: String,
}

/// Knowledge store handle. Methods take `&self`; the connection is guarded
/// internally so the store can be shared behind an `Arc`.
pub struct KnowledgeStore {
    conn: Mutex<Connection>,
}

impl KnowledgeStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open knowledge store at {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and `--ephemeral` runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default store path under the user config directory
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        let store_dir = config_dir.join("quarry");
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create {}", store_dir.display()))?;
        Ok(store_dir.join("quarry.db"))
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an entity, or refresh its type/observations if the name already
    /// exists. Returns true when the entity was newly created.
    pub fn upsert_entity(
        &self,
        name: &str,
        entity_type: &str,
        observations: &[String],
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let observations_json = serde_json::to_string(observations)?;
        let conn = self.conn();

        let existed: bool = conn
            .query_row(
                "SELECT 1 FROM entities WHERE name = ?1",
                [name],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        conn.execute(
            "INSERT INTO entities (name, entity_type, observations, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
                entity_type = excluded.entity_type,
                observations = excluded.observations,
                updated_at = excluded.updated_at",
            (name, entity_type, &observations_json, &now),
        )?;

        Ok(!existed)
    }

    /// Remove an entity by name. Returns true if a row was deleted.
    pub fn remove_entity(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM entities WHERE name = ?1", [name])?;
        Ok(deleted > 0)
    }

    pub fn entity(&self, name: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, name, entity_type, observations, created_at
                 FROM entities WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(record.map(|(id, name, entity_type, observations, created_at)| {
            EntityRecord {
                id,
                name,
                entity_type,
                observations: serde_json::from_str(&observations).unwrap_or_default(),
                created_at,
            }
        }))
    }

    pub fn entity_count(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Last successful completion timestamp for a workflow, if any
    pub fn checkpoint(&self, workflow: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT completed_at FROM checkpoints WHERE workflow = ?1",
                [workflow],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Advance the resumability point for a workflow
    pub fn set_checkpoint(&self, workflow: &str, completed_at: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO checkpoints (workflow, completed_at, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(workflow) DO UPDATE SET
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
            (workflow, completed_at, &now),
        )?;
        Ok(())
    }

    /// Record a terminal run
    pub fn record_run(&self, run: &RunRecord) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workflow_runs
                (execution_id, workflow_name, success, duration_ms, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &run.execution_id,
                &run.workflow_name,
                run.success,
                run.duration_ms,
                &run.error,
                &run.created_at,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs, newest first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT execution_id, workflow_name, success, duration_ms, error, created_at
             FROM workflow_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RunRecord {
                execution_id: row.get(0)?,
                workflow_name: row.get(1)?,
                success: row.get(2)?,
                duration_ms: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                error: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
