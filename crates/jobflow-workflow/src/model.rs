//! Workflow data model: instances, statuses and events.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use jobflow_core::{JobflowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 5] = [
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Suspended,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Suspended => "SUSPENDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobflowError::Invalid(format!("unknown workflow status '{s}'")))
    }

    /// No step ever runs again for a terminal instance (except explicit re-entry from FAILED).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open set of event names. Each workflow domain defines its own constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(Cow<'static, str>);

impl EventType {
    pub const WORKFLOW_COMPLETED: EventType = EventType::from_static("WORKFLOW_COMPLETED");
    pub const WORKFLOW_FAILED: EventType = EventType::from_static("WORKFLOW_FAILED");
    pub const WORKFLOW_CANCELLED: EventType = EventType::from_static("WORKFLOW_CANCELLED");
    pub const TIMEOUT: EventType = EventType::from_static("TIMEOUT");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for EventType {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// A signal emitted by a step; selects the next step through the transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub source: Option<String>,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event_type: impl Into<EventType>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
            source: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Error text carried by failure events.
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// A durable, caller-referenced run of a named workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub reference_id: String,
    pub workflow_name: String,
    pub current_step: String,
    pub status: WorkflowStatus,
    /// Business payload shared by all steps.
    pub context: Value,
    /// Step-to-step scratch data.
    pub variables: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_by: String,
    pub last_modified_by: Option<String>,
}

impl WorkflowInstance {
    /// A fresh RUNNING instance positioned at `initial_step`.
    pub fn new(
        workflow_name: &str,
        reference_id: &str,
        initial_step: &str,
        context: Value,
        created_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            reference_id: reference_id.to_string(),
            workflow_name: workflow_name.to_string(),
            current_step: initial_step.to_string(),
            status: WorkflowStatus::Running,
            context,
            variables: HashMap::new(),
            started_at: now,
            ended_at: None,
            updated_at: now,
            error_message: None,
            created_by: created_by.to_string(),
            last_modified_by: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.finish(WorkflowStatus::Failed);
    }

    /// Back to RUNNING with the previous failure cleared.
    pub fn reopen(&mut self, operator: Option<&str>) {
        self.status = WorkflowStatus::Running;
        self.error_message = None;
        self.ended_at = None;
        if let Some(op) = operator {
            self.last_modified_by = Some(op.to_string());
        }
        self.touch();
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn variable_str(&self, key: &str) -> Option<&str> {
        self.variables.get(key).and_then(Value::as_str)
    }

    pub fn set_variable(&mut self, key: &str, value: impl Into<Value>) {
        self.variables.insert(key.to_string(), value.into());
    }

    pub fn remove_variable(&mut self, key: &str) -> Option<Value> {
        self.variables.remove(key)
    }

    /// String field of the context object.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Set a field on the context object, turning a non-object context into one.
    pub fn set_context(&mut self, key: &str, value: impl Into<Value>) {
        if !self.context.is_object() {
            self.context = Value::Object(Map::new());
        }
        if let Some(map) = self.context.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
    }
}

/// Aggregate counts over all stored instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub suspended: u64,
    pub cancelled: u64,
    /// Percent of all instances that completed.
    pub success_rate: f64,
    /// Percent of all instances that failed.
    pub failure_rate: f64,
}

impl WorkflowStats {
    pub fn from_counts(counts: &[(WorkflowStatus, u64)]) -> Self {
        let mut stats = Self::default();
        for (status, n) in counts {
            stats.total += n;
            match status {
                WorkflowStatus::Running => stats.running += n,
                WorkflowStatus::Completed => stats.completed += n,
                WorkflowStatus::Failed => stats.failed += n,
                WorkflowStatus::Suspended => stats.suspended += n,
                WorkflowStatus::Cancelled => stats.cancelled += n,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 * 100.0 / stats.total as f64;
            stats.failure_rate = stats.failed as f64 * 100.0 / stats.total as f64;
        }
        stats
    }
}
