//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Definitions and execution records are stored as JSON
//! blobs next to a few indexed columns used for listing. Wakes are plain rows
//! with a millisecond due time.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::Row;
use stepwise_core::repository::execution::ExecutionRepository;
use stepwise_types::definition::WorkflowDefinition;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{ExecutionStatus, ScheduledWake, WakeKind, WorkflowExecution};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: DatabasePool,
}

impl SqliteRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct ExecutionRow {
    execution: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution: row.try_get("execution")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        serde_json::from_str(&self.execution)
            .map_err(|e| RepositoryError::Query(format!("invalid execution JSON: {e}")))
    }
}

struct WakeRow {
    id: String,
    execution_id: String,
    step_id: String,
    kind: String,
    due_at: i64,
}

impl WakeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            kind: row.try_get("kind")?,
            due_at: row.try_get("due_at")?,
        })
    }

    fn into_wake(self) -> Result<ScheduledWake, RepositoryError> {
        let kind: WakeKind = self.kind.parse().map_err(RepositoryError::Query)?;
        let due_at = Utc
            .timestamp_millis_opt(self.due_at)
            .single()
            .ok_or_else(|| RepositoryError::Query(format!("invalid due_at: {}", self.due_at)))?;
        Ok(ScheduledWake {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            kind,
            due_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

/// Fixed-width RFC 3339 so text columns sort chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn definition_status(def: &WorkflowDefinition) -> Result<String, RepositoryError> {
    serde_json::to_value(def.status)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Query("definition status is not a string".into()))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let status = definition_status(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, version, name, tenant_id, status, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id, version) DO UPDATE SET
                 name = excluded.name,
                 tenant_id = excluded.tenant_id,
                 status = excluded.status,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(i64::from(def.version))
        .bind(&def.name)
        .bind(&def.tenant_id)
        .bind(&status)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::debug!(workflow_id = %def.id, version = def.version, "saved definition");
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?")
            .bind(id.to_string())
            .bind(i64::from(version))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.definition FROM workflow_definitions d
               WHERE d.version = (SELECT MAX(version) FROM workflow_definitions WHERE id = d.id)
               ORDER BY d.name ASC, d.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row).map_err(query_err)?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let execution_json = serde_json::to_string(execution)
            .map_err(|e| RepositoryError::Query(format!("serialize execution: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, version, workflow_name, status, execution, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 execution = excluded.execution,
                 updated_at = excluded.updated_at"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(i64::from(execution.version))
        .bind(&execution.workflow_name)
        .bind(execution.status.as_str())
        .bind(&execution_json)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn load_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT execution FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT execution FROM workflow_executions WHERE status = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT execution FROM workflow_executions ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_err)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn schedule_wake(&self, wake: &ScheduledWake) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO scheduled_wakes (id, execution_id, step_id, kind, due_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET due_at = excluded.due_at"#,
        )
        .bind(wake.id.to_string())
        .bind(wake.execution_id.to_string())
        .bind(&wake.step_id)
        .bind(wake.kind.as_str())
        .bind(wake.due_at.timestamp_millis())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, execution_id, step_id, kind, due_at FROM scheduled_wakes WHERE due_at <= ? ORDER BY due_at ASC, id ASC",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut wakes = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WakeRow::from_row(row).map_err(query_err)?;
            wakes.push(r.into_wake()?);
        }
        Ok(wakes)
    }

    async fn delete_wake(&self, id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM scheduled_wakes WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn delete_wakes_for_step(&self, execution_id: &Uuid, step_id: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM scheduled_wakes WHERE execution_id = ? AND step_id = ?")
            .bind(execution_id.to_string())
            .bind(step_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        tracing::trace!(%execution_id, step_id, removed = result.rows_affected(), "deleted step wakes");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
