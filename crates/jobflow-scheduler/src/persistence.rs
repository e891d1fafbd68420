//! SQLite-backed job store.
//! Every mutation touches exactly one row; the running flag doubles as the
//! claim that keeps a job from being executed twice.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use jobflow_core::{JobflowError, Result};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::job::{Job, JobId};

/// Durable job storage used by the scheduler, dispatcher and runner.
pub trait JobStore: Send + Sync {
    /// Persist a new job and return its assigned ID.
    fn insert(&self, job: &Job) -> Result<JobId>;
    fn get(&self, id: JobId) -> Result<Option<Job>>;
    fn list(&self) -> Result<Vec<Job>>;
    /// Returns false when no such job existed.
    fn delete(&self, id: JobId) -> Result<bool>;
    /// Jobs firing at or before `until` that are neither running nor abandoned.
    fn find_due(&self, until: DateTime<Utc>) -> Result<Vec<Job>>;
    /// Atomically set is-running, but only if the job is idle and still due at
    /// `expected_fire_at`. Returns the claimed job, or None if someone else
    /// owns it or it has moved.
    fn claim(&self, id: JobId, expected_fire_at: DateTime<Utc>) -> Result<Option<Job>>;
    /// Clear is-running and move the job to `next_fire_at` in one write.
    fn reschedule(&self, id: JobId, next_fire_at: DateTime<Utc>, last_error: Option<&str>) -> Result<()>;
    /// Clear is-running and mark the job terminal.
    fn abandon(&self, id: JobId, error: &str) -> Result<()>;
    /// Clear is-running on every job. Returns the number of rows reset.
    fn reset_running_flags(&self) -> Result<usize>;
}

fn db_err(e: rusqlite::Error) -> JobflowError {
    JobflowError::Store(e.to_string())
}

const JOB_COLUMNS: &str = "id, task_name, payload, next_fire_at, interval_days, is_recurring, \
                           is_running, abandoned, last_error, created_at";

/// SQLite implementation of [`JobStore`].
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, handy for tests and dry runs.
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
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '',
                next_fire_at INTEGER NOT NULL,          -- unix millis
                interval_days INTEGER NOT NULL DEFAULT 0,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                is_running INTEGER NOT NULL DEFAULT 0,
                abandoned INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (next_fire_at);
            ",
            )
            .map_err(|e| JobflowError::Store(format!("Migration: {e}")))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| JobflowError::Store(format!("job store lock poisoned: {e}")))
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let fire_ms: i64 = row.get(3)?;
    let created: String = row.get(9)?;
    Ok(Job {
        id: row.get(0)?,
        task_name: row.get(1)?,
        payload: row.get(2)?,
        next_fire_at: DateTime::from_timestamp_millis(fire_ms).unwrap_or_default(),
        interval_days: row.get(4)?,
        is_recurring: row.get::<_, i32>(5)? != 0,
        is_running: row.get::<_, i32>(6)? != 0,
        abandoned: row.get::<_, i32>(7)? != 0,
        last_error: row.get(8)?,
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job) -> Result<JobId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (task_name, payload, next_fire_at, interval_days, is_recurring,
                               is_running, abandoned, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, NULL, ?6)",
            rusqlite::params![
                job.task_name,
                job.payload,
                job.next_fire_at.timestamp_millis(),
                job.interval_days,
                job.is_recurring as i32,
                job.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.conn()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()
            .map_err(db_err)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY next_fire_at, id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_job).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete(&self, id: JobId) -> Result<bool> {
        let n = self
            .conn()?
            .execute("DELETE FROM jobs WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    fn find_due(&self, until: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE next_fire_at <= ?1 AND is_running = 0 AND abandoned = 0
                 ORDER BY next_fire_at, id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([until.timestamp_millis()], row_to_job)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn claim(&self, id: JobId, expected_fire_at: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let claimed = conn
            .execute(
                "UPDATE jobs SET is_running = 1
                 WHERE id = ?1 AND is_running = 0 AND abandoned = 0 AND next_fire_at = ?2",
                rusqlite::params![id, expected_fire_at.timestamp_millis()],
            )
            .map_err(db_err)?;
        if claimed == 0 {
            return Ok(None);
        }
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    fn reschedule(&self, id: JobId, next_fire_at: DateTime<Utc>, last_error: Option<&str>) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE jobs SET is_running = 0, next_fire_at = ?2, last_error = ?3 WHERE id = ?1",
                rusqlite::params![id, next_fire_at.timestamp_millis(), last_error],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn abandon(&self, id: JobId, error: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE jobs SET is_running = 0, abandoned = 1, last_error = ?2 WHERE id = ?1",
                rusqlite::params![id, error],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn reset_running_flags(&self) -> Result<usize> {
        self.conn()?
            .execute("UPDATE jobs SET is_running = 0 WHERE is_running = 1", [])
            .map_err(db_err)
    }
}
