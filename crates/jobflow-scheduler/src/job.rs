//! Job definitions — the durable unit of scheduled work.

use chrono::{DateTime, Utc};
use jobflow_core::{JobflowError, Result};
use serde::{Deserialize, Serialize};

/// Store-assigned job identifier.
pub type JobId = i64;

/// A persisted request to run a named task at or after `next_fire_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned ID (0 until inserted).
    pub id: JobId,
    /// Key into the task registry.
    pub task_name: String,
    /// Opaque, task-defined payload.
    pub payload: String,
    /// Absolute fire time (millisecond precision).
    pub next_fire_at: DateTime<Utc>,
    /// Calendar recurrence in days, 0 when the job doesn't recur.
    pub interval_days: u32,
    pub is_recurring: bool,
    /// True only while a runner owns the job.
    pub is_running: bool,
    /// Terminal: the job will never be fired again.
    pub abandoned: bool,
    /// Most recent task failure, if any.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build an unsaved job. Fails when the recurrence settings are inconsistent.
    pub fn new(
        task_name: &str,
        payload: &str,
        fire_at: DateTime<Utc>,
        interval_days: u32,
        is_recurring: bool,
    ) -> Result<Self> {
        if task_name.trim().is_empty() {
            return Err(JobflowError::Invalid("task name must not be empty".into()));
        }
        if is_recurring && interval_days == 0 {
            return Err(JobflowError::Invalid(format!(
                "recurring job for task '{task_name}' needs a positive day interval"
            )));
        }
        Ok(Self {
            id: 0,
            task_name: task_name.to_string(),
            payload: payload.to_string(),
            next_fire_at: truncate_millis(fire_at),
            interval_days,
            is_recurring,
            is_running: false,
            abandoned: false,
            last_error: None,
            created_at: Utc::now(),
        })
    }

    /// A one-shot job.
    pub fn once(task_name: &str, payload: &str, fire_at: DateTime<Utc>) -> Result<Self> {
        Self::new(task_name, payload, fire_at, 0, false)
    }

    /// Whether the runner reschedules this job on its calendar interval.
    pub fn recurs(&self) -> bool {
        self.is_recurring && self.interval_days > 0
    }

    /// Parse the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Drop sub-millisecond precision so stored and in-memory times compare equal.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recurring_requires_interval() {
        let err = Job::new("report", "{}", Utc::now(), 0, true).unwrap_err();
        assert!(matches!(err, JobflowError::Invalid(_)));
        assert!(Job::new("report", "{}", Utc::now(), 1, true).unwrap().recurs());
    }

    #[test]
    fn test_empty_task_name_rejected() {
        assert!(Job::once("  ", "", Utc::now()).is_err());
    }

    #[test]
    fn test_interval_without_flag_does_not_recur() {
        let job = Job::new("report", "", Utc::now(), 3, false).unwrap();
        assert!(!job.recurs());
    }

    #[test]
    fn test_payload_json() {
        let job = Job::once("echo", r#"{"x":1}"#, Utc::now()).unwrap();
        assert_eq!(job.payload_json().unwrap()["x"], 1);
        assert_eq!(job.next_fire_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
