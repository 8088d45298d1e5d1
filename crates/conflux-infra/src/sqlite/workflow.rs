//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `conflux-core` using sqlx with split
//! read/write pools. Definitions and log transitions are stored as JSON
//! blobs. Every append checks the instance's last `seq` and updates the
//! instance index inside one write transaction.

use chrono::{DateTime, Utc};
use conflux_core::repository::workflow::WorkflowRepository;
use conflux_types::breaker::{BreakerSnapshot, BreakerState};
use conflux_types::error::RepositoryError;
use conflux_types::instance::{InstanceState, InstanceSummary, StateLogEntry, Transition};
use conflux_types::workflow::{DefinitionRef, WorkflowDefinition};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct LogRow {
    instance_id: String,
    seq: i64,
    transition: String,
    timestamp: String,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            seq: row.try_get("seq")?,
            transition: row.try_get("transition")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn into_entry(self) -> Result<StateLogEntry, RepositoryError> {
        let transition: Transition = serde_json::from_str(&self.transition)
            .map_err(|e| RepositoryError::Query(format!("invalid transition JSON: {e}")))?;
        Ok(StateLogEntry {
            instance_id: parse_uuid(&self.instance_id)?,
            seq: self.seq as u64,
            transition,
            timestamp: parse_datetime(&self.timestamp)?,
        })
    }
}

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_version: i64,
    correlation_id: String,
    state: String,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            correlation_id: row.try_get("correlation_id")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_summary(self) -> Result<InstanceSummary, RepositoryError> {
        let state: InstanceState = self
            .state
            .parse()
            .map_err(RepositoryError::Query)?;
        Ok(InstanceSummary {
            id: parse_uuid(&self.id)?,
            definition: DefinitionRef {
                id: self.definition_id,
                version: self.definition_version as u32,
            },
            correlation_id: self.correlation_id,
            state,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct BreakerRow {
    target: String,
    state: String,
    failure_count: i64,
    opened_at: Option<String>,
    cooldown_ms: i64,
}

impl BreakerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            target: row.try_get("target")?,
            state: row.try_get("state")?,
            failure_count: row.try_get("failure_count")?,
            opened_at: row.try_get("opened_at")?,
            cooldown_ms: row.try_get("cooldown_ms")?,
        })
    }

    fn into_snapshot(self) -> Result<BreakerSnapshot, RepositoryError> {
        let state: BreakerState = self.state.parse().map_err(RepositoryError::Query)?;
        Ok(BreakerSnapshot {
            target: self.target,
            state,
            failure_count: self.failure_count as u32,
            opened_at: self.opened_at.as_deref().map(parse_datetime).transpose()?,
            cooldown_ms: self.cooldown_ms as u64,
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

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, version, definition, created_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&def.id)
        .bind(def.version as i64)
        .bind(&definition_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match query_error(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
                "definition {}@v{} already exists",
                def.id, def.version
            )),
            other => other,
        })?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version as i64)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("definition").map_err(query_error)?;
                let def = serde_json::from_str(&json).map_err(|e| {
                    RepositoryError::Query(format!("invalid workflow definition JSON: {e}"))
                })?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    async fn latest_version(&self, id: &str) -> Result<Option<u32>, RepositoryError> {
        let row = sqlx::query("SELECT MAX(version) AS latest FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let latest: Option<i64> = row.try_get("latest").map_err(query_error)?;
        Ok(latest.map(|v| v as u32))
    }

    async fn list_definitions(&self) -> Result<Vec<DefinitionRef>, RepositoryError> {
        let rows = sqlx::query("SELECT id, version FROM workflow_definitions ORDER BY id ASC, version ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_error)?;
                let version: i64 = row.try_get("version").map_err(query_error)?;
                Ok(DefinitionRef {
                    id,
                    version: version as u32,
                })
            })
            .collect()
    }

    async fn append_entry(&self, entry: &StateLogEntry) -> Result<(), RepositoryError> {
        let transition_json = serde_json::to_string(&entry.transition)
            .map_err(|e| RepositoryError::Query(format!("serialize transition: {e}")))?;
        let instance_id = entry.instance_id.to_string();
        let timestamp = format_datetime(&entry.timestamp);

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS last FROM state_log WHERE instance_id = ?")
            .bind(&instance_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error)?;
        let last: i64 = row.try_get("last").map_err(query_error)?;
        if entry.seq as i64 != last + 1 {
            return Err(RepositoryError::Conflict(format!(
                "instance {} expected seq {}, got {}",
                entry.instance_id,
                last + 1,
                entry.seq
            )));
        }

        match &entry.transition {
            Transition::InstanceCreated {
                definition,
                correlation_id,
                ..
            } => {
                sqlx::query(
                    r#"INSERT INTO workflow_instances
                       (id, definition_id, definition_version, correlation_id, state, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&instance_id)
                .bind(&definition.id)
                .bind(definition.version as i64)
                .bind(correlation_id)
                .bind(InstanceState::Created.as_str())
                .bind(&timestamp)
                .bind(&timestamp)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            }
            transition => {
                let result = match transition.resulting_state() {
                    Some(state) => {
                        sqlx::query("UPDATE workflow_instances SET state = ?, updated_at = ? WHERE id = ?")
                            .bind(state.as_str())
                            .bind(&timestamp)
                            .bind(&instance_id)
                            .execute(&mut *tx)
                            .await
                    }
                    None => {
                        sqlx::query("UPDATE workflow_instances SET updated_at = ? WHERE id = ?")
                            .bind(&timestamp)
                            .bind(&instance_id)
                            .execute(&mut *tx)
                            .await
                    }
                }
                .map_err(query_error)?;
                if result.rows_affected() == 0 {
                    return Err(RepositoryError::NotFound);
                }
            }
        }

        sqlx::query(
            r#"INSERT INTO state_log (instance_id, seq, kind, step, transition, timestamp)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&instance_id)
        .bind(entry.seq as i64)
        .bind(entry.transition.name())
        .bind(entry.transition.step())
        .bind(&transition_json)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn load_log(&self, instance_id: &Uuid) -> Result<Vec<StateLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT instance_id, seq, transition, timestamp FROM state_log WHERE instance_id = ? ORDER BY seq ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = LogRow::from_row(row).map_err(query_error)?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    async fn list_instances(
        &self,
        active_only: bool,
    ) -> Result<Vec<InstanceSummary>, RepositoryError> {
        let rows = if active_only {
            sqlx::query(
                "SELECT * FROM workflow_instances WHERE state NOT IN ('completed', 'failed', 'cancelled') ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(&self.pool.reader)
            .await
        } else {
            sqlx::query("SELECT * FROM workflow_instances ORDER BY created_at DESC, id DESC")
                .fetch_all(&self.pool.reader)
                .await
        }
        .map_err(query_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            summaries.push(r.into_summary()?);
        }
        Ok(summaries)
    }

    async fn upsert_breaker(&self, snapshot: &BreakerSnapshot) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO circuit_breakers (target, state, failure_count, opened_at, cooldown_ms, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(target) DO UPDATE SET
                 state = excluded.state,
                 failure_count = excluded.failure_count,
                 opened_at = excluded.opened_at,
                 cooldown_ms = excluded.cooldown_ms,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&snapshot.target)
        .bind(snapshot.state.as_str())
        .bind(snapshot.failure_count as i64)
        .bind(snapshot.opened_at.as_ref().map(format_datetime))
        .bind(snapshot.cooldown_ms as i64)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_breakers(&self) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT target, state, failure_count, opened_at, cooldown_ms FROM circuit_breakers ORDER BY target ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = BreakerRow::from_row(row).map_err(query_error)?;
            snapshots.push(r.into_snapshot()?);
        }
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
