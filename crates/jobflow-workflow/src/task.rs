//! `workflow_task` — the job task that (re-)enters a workflow instance.
//! Every step execution, first run, poll and retry goes through a job
//! with this task name and an `{"instanceId": ...}` payload.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::{JobflowError, Result};
use jobflow_scheduler::{Job, JobId, JobScheduler, Task};
use serde::{Deserialize, Serialize};

use crate::engine::WorkflowEngine;

/// Task name the engine registers with the scheduler.
pub const WORKFLOW_TASK: &str = "workflow_task";

#[derive(Debug, Serialize, Deserialize)]
struct WorkflowTaskPayload {
    #[serde(rename = "instanceId")]
    instance_id: String,
}

/// Job payload addressing one workflow instance.
pub fn task_payload(reference_id: &str) -> Result<String> {
    Ok(serde_json::to_string(&WorkflowTaskPayload {
        instance_id: reference_id.to_string(),
    })?)
}

/// Schedule a `workflow_task` job for `reference_id` after `delay`.
pub(crate) fn schedule_resume(
    scheduler: &Arc<JobScheduler>,
    reference_id: &str,
    delay: Duration,
) -> Result<JobId> {
    let id = scheduler.schedule_after(WORKFLOW_TASK, &task_payload(reference_id)?, delay)?;
    tracing::debug!("workflow '{}' resumes via job {} in {:?}", reference_id, id, delay);
    Ok(id)
}

/// Loads the addressed instance and executes its current step.
pub struct WorkflowTask {
    engine: Weak<WorkflowEngine>,
}

impl WorkflowTask {
    pub fn new(engine: Weak<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Task for WorkflowTask {
    async fn run(&mut self, job: &Job) -> Result<()> {
        let payload: WorkflowTaskPayload = serde_json::from_str(&job.payload)?;
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| JobflowError::Other("workflow engine is gone".into()))?;

        let Some(mut instance) = engine.get_instance(&payload.instance_id)? else {
            return Err(JobflowError::NotFound(format!(
                "workflow instance '{}'",
                payload.instance_id
            )));
        };
        if instance.is_terminal() {
            tracing::info!(
                "⏭️ Workflow '{}' is {}, nothing to run",
                instance.reference_id,
                instance.status
            );
            return Ok(());
        }
        engine.execute_current_step(&mut instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = task_payload("4711").unwrap();
        assert_eq!(payload, r#"{"instanceId":"4711"}"#);
        let parsed: WorkflowTaskPayload = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.instance_id, "4711");
    }
}
