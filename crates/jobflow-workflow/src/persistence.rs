//! SQLite-backed storage for workflow instances and their event history.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use jobflow_core::{JobflowError, Result};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::model::{EventType, WorkflowEvent, WorkflowInstance, WorkflowStats, WorkflowStatus};

/// Durable workflow storage. Each call reads or writes one instance row
/// (plus its event rows).
pub trait WorkflowStore: Send + Sync {
    /// Insert a new instance. Returns false if the reference ID is taken.
    fn insert_instance(&self, instance: &WorkflowInstance) -> Result<bool>;
    /// Insert or overwrite.
    fn save_instance(&self, instance: &WorkflowInstance) -> Result<()>;
    /// Overwrite the stored row only while it is still RUNNING. Returns false
    /// when the instance was stopped (or deleted) in the meantime.
    fn update_running(&self, instance: &WorkflowInstance) -> Result<bool>;
    fn get_instance(&self, reference_id: &str) -> Result<Option<WorkflowInstance>>;
    fn list_instances(&self) -> Result<Vec<WorkflowInstance>>;
    fn instances_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>>;
    /// Most recently started first.
    fn recent_instances(&self, limit: usize) -> Result<Vec<WorkflowInstance>>;
    /// Remove the instance and its history. Returns false when absent.
    fn delete_instance(&self, reference_id: &str) -> Result<bool>;
    fn save_event(&self, reference_id: &str, event: &WorkflowEvent) -> Result<()>;
    /// History in the order it was recorded.
    fn events_for(&self, reference_id: &str) -> Result<Vec<WorkflowEvent>>;
    fn statistics(&self) -> Result<WorkflowStats>;
}

fn db_err(e: rusqlite::Error) -> JobflowError {
    JobflowError::Store(e.to_string())
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

const INSTANCE_COLUMNS: &str = "reference_id, workflow_name, current_step, status, context, variables, \
                                started_at, ended_at, updated_at, error_message, created_by, last_modified_by";

/// SQLite implementation of [`WorkflowStore`].
pub struct SqliteWorkflowStore {
    conn: Mutex<Connection>,
}

impl SqliteWorkflowStore {
    /// Open or create the workflow database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path).map_err(db_err)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Job and workflow stores share one database file.
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS workflow_instances (
                reference_id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                current_step TEXT NOT NULL,
                status TEXT NOT NULL,             -- RUNNING, COMPLETED, FAILED, SUSPENDED, CANCELLED
                context TEXT NOT NULL DEFAULT 'null',     -- JSON
                variables TEXT NOT NULL DEFAULT '{}',     -- JSON object
                started_at TEXT NOT NULL,
                ended_at TEXT,
                updated_at TEXT NOT NULL,
                error_message TEXT,
                created_by TEXT NOT NULL,
                last_modified_by TEXT
            );

            CREATE TABLE IF NOT EXISTS workflow_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reference_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',       -- JSON object
                source TEXT,
                correlation_id TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_events_ref ON workflow_events (reference_id);
            ",
            )
            .map_err(|e| JobflowError::Store(format!("Migration: {e}")))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| JobflowError::Store(format!("workflow store lock poisoned: {e}")))
    }

    fn query_instances(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<WorkflowInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map(params, row_to_instance).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<WorkflowInstance> {
    let status: String = row.get(3)?;
    let context: String = row.get(4)?;
    let variables: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(WorkflowInstance {
        reference_id: row.get(0)?,
        workflow_name: row.get(1)?,
        current_step: row.get(2)?,
        // Unknown statuses park the instance where the engine won't touch it.
        status: WorkflowStatus::parse(&status).unwrap_or(WorkflowStatus::Suspended),
        context: serde_json::from_str(&context).unwrap_or(Value::Null),
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        started_at: parse_time(&started_at),
        ended_at: ended_at.as_deref().map(parse_time),
        updated_at: parse_time(&updated_at),
        error_message: row.get(9)?,
        created_by: row.get(10)?,
        last_modified_by: row.get(11)?,
    })
}

fn instance_params(i: &WorkflowInstance) -> Result<[Box<dyn rusqlite::ToSql>; 12]> {
    Ok([
        Box::new(i.reference_id.clone()),
        Box::new(i.workflow_name.clone()),
        Box::new(i.current_step.clone()),
        Box::new(i.status.as_str()),
        Box::new(serde_json::to_string(&i.context)?),
        Box::new(serde_json::to_string(&i.variables)?),
        Box::new(i.started_at.to_rfc3339()),
        Box::new(i.ended_at.map(|t| t.to_rfc3339())),
        Box::new(i.updated_at.to_rfc3339()),
        Box::new(i.error_message.clone()),
        Box::new(i.created_by.clone()),
        Box::new(i.last_modified_by.clone()),
    ])
}

impl WorkflowStore for SqliteWorkflowStore {
    fn insert_instance(&self, instance: &WorkflowInstance) -> Result<bool> {
        let params = instance_params(instance)?;
        let n = self
            .conn()?
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO workflow_instances ({INSTANCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn save_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        let params = instance_params(instance)?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO workflow_instances ({INSTANCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn update_running(&self, instance: &WorkflowInstance) -> Result<bool> {
        let params = instance_params(instance)?;
        let n = self
            .conn()?
            .execute(
                "UPDATE workflow_instances SET
                     workflow_name = ?2, current_step = ?3, status = ?4, context = ?5, variables = ?6,
                     started_at = ?7, ended_at = ?8, updated_at = ?9, error_message = ?10,
                     created_by = ?11, last_modified_by = ?12
                 WHERE reference_id = ?1 AND status = 'RUNNING'",
                rusqlite::params_from_iter(params.iter()),
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn get_instance(&self, reference_id: &str) -> Result<Option<WorkflowInstance>> {
        self.conn()?
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE reference_id = ?1"),
                [reference_id],
                row_to_instance,
            )
            .optional()
            .map_err(db_err)
    }

    fn list_instances(&self) -> Result<Vec<WorkflowInstance>> {
        self.query_instances(
            &format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances ORDER BY started_at, reference_id"),
            &[],
        )
    }

    fn instances_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>> {
        self.query_instances(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 WHERE status = ?1 ORDER BY started_at, reference_id"
            ),
            &[&status.as_str() as &dyn rusqlite::ToSql],
        )
    }

    fn recent_instances(&self, limit: usize) -> Result<Vec<WorkflowInstance>> {
        let limit = limit as i64;
        self.query_instances(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
                 ORDER BY started_at DESC, reference_id DESC LIMIT ?1"
            ),
            &[&limit as &dyn rusqlite::ToSql],
        )
    }

    fn delete_instance(&self, reference_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM workflow_events WHERE reference_id = ?1",
            [reference_id],
        )
        .map_err(db_err)?;
        let n = conn
            .execute(
                "DELETE FROM workflow_instances WHERE reference_id = ?1",
                [reference_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn save_event(&self, reference_id: &str, event: &WorkflowEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn()?
            .execute(
                "INSERT INTO workflow_events
                 (reference_id, event_type, payload, source, correlation_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    reference_id,
                    event.event_type.as_str(),
                    payload,
                    event.source,
                    event.correlation_id,
                    event.timestamp.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn events_for(&self, reference_id: &str) -> Result<Vec<WorkflowEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_type, payload, source, correlation_id, timestamp
                 FROM workflow_events WHERE reference_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([reference_id], |row| {
                let event_type: String = row.get(0)?;
                let payload: String = row.get(1)?;
                let timestamp: String = row.get(4)?;
                Ok(WorkflowEvent {
                    event_type: EventType::from(event_type),
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    source: row.get(2)?,
                    correlation_id: row.get(3)?,
                    timestamp: parse_time(&timestamp),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn statistics(&self) -> Result<WorkflowStats> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM workflow_instances GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, n) = row.map_err(db_err)?;
            if let Ok(status) = WorkflowStatus::parse(&status) {
                counts.push((status, n.max(0) as u64));
            }
        }
        Ok(WorkflowStats::from_counts(&counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteWorkflowStore {
        SqliteWorkflowStore::open_in_memory().unwrap()
    }

    fn instance(reference: &str) -> WorkflowInstance {
        WorkflowInstance::new("build", reference, "BUILD_INITIATION", json!({"monitorId": "m-1"}), "ops@corp")
    }

    #[test]
    fn test_insert_get_round_trip() {
        let store = store();
        let mut inst = instance("100");
        inst.set_variable("buildId", "b-7");
        assert!(store.insert_instance(&inst).unwrap());

        let loaded = store.get_instance("100").unwrap().unwrap();
        assert_eq!(loaded.workflow_name, "build");
        assert_eq!(loaded.current_step, "BUILD_INITIATION");
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(loaded.context["monitorId"], "m-1");
        assert_eq!(loaded.variable_str("buildId"), Some("b-7"));
        assert_eq!(loaded.created_by, "ops@corp");
        assert!(store.get_instance("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_rejects_duplicate_reference() {
        let store = store();
        assert!(store.insert_instance(&instance("100")).unwrap());
        assert!(!store.insert_instance(&instance("100")).unwrap());
    }

    #[test]
    fn test_save_overwrites() {
        let store = store();
        let mut inst = instance("100");
        store.save_instance(&inst).unwrap();
        inst.current_step = "BUILD_IN_PROGRESS".into();
        inst.fail("build service down");
        store.save_instance(&inst).unwrap();

        let loaded = store.get_instance("100").unwrap().unwrap();
        assert_eq!(loaded.current_step, "BUILD_IN_PROGRESS");
        assert_eq!(loaded.status, WorkflowStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("build service down"));
        assert!(loaded.ended_at.is_some());
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn test_update_running_skips_stopped_instances() {
        let store = store();
        let mut inst = instance("100");
        store.insert_instance(&inst).unwrap();

        inst.current_step = "BUILD_IN_PROGRESS".into();
        assert!(store.update_running(&inst).unwrap());

        let mut stopped = inst.clone();
        stopped.finish(WorkflowStatus::Cancelled);
        store.save_instance(&stopped).unwrap();

        inst.current_step = "BUILD_COMPLETED".into();
        assert!(!store.update_running(&inst).unwrap());
        let loaded = store.get_instance("100").unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Cancelled);
        assert_eq!(loaded.current_step, "BUILD_IN_PROGRESS");
        assert!(!store.update_running(&instance("missing")).unwrap());
    }

    #[test]
    fn test_queries_and_statistics() {
        let store = store();
        let mut a = instance("a");
        a.finish(WorkflowStatus::Completed);
        let mut b = instance("b");
        b.fail("x");
        let c = instance("c");
        for i in [&a, &b, &c] {
            store.save_instance(i).unwrap();
        }

        let failed = store.instances_by_status(WorkflowStatus::Failed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reference_id, "b");
        assert_eq!(store.recent_instances(2).unwrap().len(), 2);

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_events_and_delete() {
        let store = store();
        store.save_instance(&instance("100")).unwrap();
        store
            .save_event("100", &WorkflowEvent::new("BUILD_STARTED").with("buildId", "b-1"))
            .unwrap();
        store
            .save_event("100", &WorkflowEvent::new("BUILD_COMPLETED").with_source("BUILD_IN_PROGRESS"))
            .unwrap();

        let events = store.events_for("100").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type.as_str(), "BUILD_STARTED");
        assert_eq!(events[0].payload["buildId"], "b-1");
        assert_eq!(events[1].source.as_deref(), Some("BUILD_IN_PROGRESS"));

        assert!(store.delete_instance("100").unwrap());
        assert!(store.events_for("100").unwrap().is_empty());
        assert!(!store.delete_instance("100").unwrap());
    }

    #[test]
    fn test_file_backed_store() {
        let path = std::env::temp_dir().join("jobflow-test-workflows.db");
        std::fs::remove_file(&path).ok();
        {
            let store = SqliteWorkflowStore::open(&path).unwrap();
            store.save_instance(&instance("persisted")).unwrap();
        }
        let store = SqliteWorkflowStore::open(&path).unwrap();
        assert!(store.get_instance("persisted").unwrap().is_some());
        std::fs::remove_file(&path).ok();
    }
}
