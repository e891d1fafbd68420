//! Step contract — what the engine knows about a unit of workflow logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::Result;
use jobflow_scheduler::{JobId, JobScheduler};

use crate::model::{EventType, WorkflowEvent, WorkflowInstance};
use crate::task;

/// Whether a step does work or only routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Executes logic, usually against an external collaborator.
    Action,
    /// Only inspects the instance to pick the next branch.
    Decision,
}

/// Static metadata for a step.
#[derive(Debug, Clone)]
pub struct StepMeta {
    pub name: String,
    pub description: String,
    pub kind: StepKind,
    /// Enforced by the engine; elapsing it counts as a step error.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Emitted when the step keeps failing after its retries.
    pub failure_event: Option<EventType>,
}

impl StepMeta {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn action(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            kind: StepKind::Action,
            timeout: Self::DEFAULT_TIMEOUT,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            failure_event: None,
        }
    }

    pub fn decision(name: &str) -> Self {
        Self {
            kind: StepKind::Decision,
            ..Self::action(name)
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn failure_event(mut self, event: impl Into<EventType>) -> Self {
        self.failure_event = Some(event.into());
        self
    }

    /// Variable holding this step's consecutive failure count.
    pub fn retry_key(&self) -> String {
        format!("retry_count_{}", self.name)
    }
}

/// Services handed to a step for one execution.
pub struct StepContext {
    scheduler: Arc<JobScheduler>,
}

impl StepContext {
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Schedule the follow-up execution of `instance`'s current step.
    ///
    /// A step that returns `Ok(None)` must call this exactly once; it is the
    /// instance's only outstanding continuation.
    pub fn resume_after(&self, instance: &WorkflowInstance, delay: Duration) -> Result<JobId> {
        task::schedule_resume(&self.scheduler, &instance.reference_id, delay)
    }
}

/// A named unit of workflow logic.
///
/// Steps hold no per-instance state. They read and mutate the instance and
/// return the event that picks the next step, or `None` to suspend.
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    fn meta(&self) -> &StepMeta;

    async fn execute(
        &self,
        ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>>;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults() {
        let meta = StepMeta::action("BUILD_INITIATION");
        assert_eq!(meta.timeout, Duration::from_secs(300));
        assert_eq!(meta.max_retries, 3);
        assert_eq!(meta.kind, StepKind::Action);
        assert!(meta.failure_event.is_none());
        assert_eq!(meta.retry_key(), "retry_count_BUILD_INITIATION");
    }

    #[test]
    fn test_meta_builder() {
        let meta = StepMeta::decision("NEXT_PRODUCT")
            .description("pick next product")
            .timeout(Duration::from_secs(60))
            .max_retries(0)
            .failure_event("BUILD_FAILED");
        assert_eq!(meta.kind, StepKind::Decision);
        assert_eq!(meta.max_retries, 0);
        assert_eq!(meta.failure_event, Some(EventType::from("BUILD_FAILED")));
    }
}
