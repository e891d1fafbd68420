//! Workflow engine — runs steps, applies transitions and persists instances.
//!
//! The engine owns no timers. Every entry into an instance is either a
//! caller (schedule, re-entry, retry) or a `workflow_task` job fired by the
//! scheduler, and a step that waits must leave exactly one such job behind.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use jobflow_core::{JobflowError, Result, WorkflowConfig};
use jobflow_scheduler::JobScheduler;
use serde_json::Value;

use crate::definition::{TerminalStatus, WorkflowDefinition};
use crate::model::{EventType, WorkflowEvent, WorkflowInstance, WorkflowStats, WorkflowStatus};
use crate::persistence::WorkflowStore;
use crate::step::{StepContext, WorkflowStep};
use crate::task::{self, WORKFLOW_TASK, WorkflowTask};

/// Variable holding the error text of the last step that gave up.
pub const LAST_ERROR_VAR: &str = "lastError";

pub struct WorkflowEngine {
    scheduler: Arc<JobScheduler>,
    store: Arc<dyn WorkflowStore>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    /// Create the engine and register `workflow_task` with the scheduler.
    pub fn new(
        scheduler: Arc<JobScheduler>,
        store: Arc<dyn WorkflowStore>,
        config: WorkflowConfig,
    ) -> Result<Arc<Self>> {
        let engine = Arc::new(Self {
            scheduler,
            store,
            definitions: RwLock::new(HashMap::new()),
            config,
        });
        let weak = Arc::downgrade(&engine);
        engine
            .scheduler
            .registry()
            .register(WORKFLOW_TASK, move || Box::new(WorkflowTask::new(weak.clone())))?;
        Ok(engine)
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Register a workflow definition under its name.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut defs = self
            .definitions
            .write()
            .map_err(|e| JobflowError::Other(format!("definition registry lock poisoned: {e}")))?;
        let name = definition.name().to_string();
        if defs.contains_key(&name) {
            return Err(JobflowError::Config(format!(
                "workflow '{name}' is already registered"
            )));
        }
        tracing::info!(
            "🧭 Workflow registered: '{}' ({} steps, starts at {})",
            name,
            definition.step_names().len(),
            definition.initial_step()
        );
        defs.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .map_err(|e| JobflowError::Other(format!("definition registry lock poisoned: {e}")))?
            .get(name)
            .cloned()
            .ok_or_else(|| JobflowError::NotFound(format!("workflow definition '{name}'")))
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    // ─── Scheduling & execution ───────────────────────────────

    /// Create a RUNNING instance at the workflow's start step and schedule
    /// a job that executes it.
    pub fn schedule_workflow(
        &self,
        name: &str,
        reference_id: &str,
        initial_context: Value,
        initiator: Option<&str>,
    ) -> Result<WorkflowInstance> {
        if reference_id.trim().is_empty() {
            return Err(JobflowError::Invalid("reference ID must not be empty".into()));
        }
        let definition = self.definition(name)?;
        let created_by = initiator.unwrap_or(&self.config.default_initiator);
        let mut instance = WorkflowInstance::new(
            name,
            reference_id,
            definition.initial_step(),
            initial_context,
            created_by,
        );
        if !self.store.insert_instance(&instance)? {
            return Err(JobflowError::InvalidState(format!(
                "workflow instance '{reference_id}' already exists"
            )));
        }

        match task::schedule_resume(&self.scheduler, reference_id, Duration::ZERO) {
            Ok(job_id) => {
                tracing::info!(
                    "🚀 Workflow '{}' [{}] scheduled at {} by {} (job {})",
                    name,
                    reference_id,
                    instance.current_step,
                    created_by,
                    job_id
                );
                Ok(instance)
            }
            Err(e) => {
                instance.fail(format!("could not schedule first step: {e}"));
                self.store.save_instance(&instance)?;
                Err(e)
            }
        }
    }

    /// Execute the instance's current step and follow synchronous
    /// transitions until a step suspends or the instance ends.
    ///
    /// Only RUNNING instances are touched, and every write made here only
    /// lands while the stored row is still RUNNING: an instance cancelled
    /// mid-step stays cancelled and `instance` is reloaded from the store.
    /// Step failures never surface as errors here; they end up on the
    /// instance. Errors are reserved for store and registry problems.
    pub async fn execute_current_step(&self, instance: &mut WorkflowInstance) -> Result<()> {
        let definition = self.definition(&instance.workflow_name)?;
        loop {
            if instance.status != WorkflowStatus::Running {
                tracing::debug!(
                    "workflow '{}' is {}, not executing",
                    instance.reference_id,
                    instance.status
                );
                return Ok(());
            }

            let Some(step) = definition.step(&instance.current_step).cloned() else {
                let msg = format!("No step definition found for state: {}", instance.current_step);
                tracing::error!("❌ Workflow '{}': {}", instance.reference_id, msg);
                instance.fail(msg);
                self.persist(instance)?;
                return Ok(());
            };

            let retry_key = step.meta().retry_key();
            let event = match self.run_step(&step, instance).await {
                Ok(Some(event)) => {
                    instance.remove_variable(&retry_key);
                    event
                }
                Ok(None) => {
                    instance.remove_variable(&retry_key);
                    instance.touch();
                    if self.persist(instance)? {
                        tracing::info!(
                            "⏸️ Workflow '{}' waiting at {}",
                            instance.reference_id,
                            instance.current_step
                        );
                    }
                    return Ok(());
                }
                Err(error) => match self.handle_step_error(step.as_ref(), instance, error)? {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            if !self.apply_event(&definition, instance, event)? {
                return Ok(());
            }
        }
    }

    /// Run one step under its timeout. Panics count as step errors, and a
    /// step cut short that way leaves the instance data as it found it.
    async fn run_step(
        &self,
        step: &Arc<dyn WorkflowStep>,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let meta = step.meta();
        let ctx = StepContext::new(Arc::clone(&self.scheduler));
        tracing::debug!("running step {} for '{}'", meta.name, instance.reference_id);

        let context = instance.context.clone();
        let variables = instance.variables.clone();
        let execution = AssertUnwindSafe(step.execute(&ctx, instance)).catch_unwind();
        let aborted = match tokio::time::timeout(meta.timeout, execution).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => JobflowError::step(format!("step '{}' panicked", meta.name)),
            Err(_) => JobflowError::Timeout(format!(
                "step '{}' exceeded its {}s timeout",
                meta.name,
                meta.timeout.as_secs()
            )),
        };
        instance.context = context;
        instance.variables = variables;
        Err(aborted)
    }

    /// Retry with backoff while attempts remain, then route to the failure
    /// event or fail the instance. Returns the event to apply, if any.
    fn handle_step_error(
        &self,
        step: &dyn WorkflowStep,
        instance: &mut WorkflowInstance,
        error: JobflowError,
    ) -> Result<Option<WorkflowEvent>> {
        let meta = step.meta();
        let key = meta.retry_key();
        let attempts = instance.variable(&key).and_then(Value::as_u64).unwrap_or(0) as u32;

        if attempts < meta.max_retries {
            let attempt = attempts + 1;
            let backoff = self.retry_backoff(attempt);
            instance.set_variable(&key, attempt);
            instance.touch();
            tracing::warn!(
                "🔄 Step {} of '{}' failed (attempt {}/{}), retrying in {}s: {error}",
                meta.name,
                instance.reference_id,
                attempt,
                meta.max_retries,
                backoff.as_secs()
            );
            if let Err(e) = task::schedule_resume(&self.scheduler, &instance.reference_id, backoff) {
                instance.fail(format!("could not schedule retry of {}: {e}", meta.name));
            }
            self.persist(instance)?;
            return Ok(None);
        }

        instance.remove_variable(&key);
        instance.set_variable(LAST_ERROR_VAR, error.to_string());
        match &meta.failure_event {
            Some(failure) => {
                tracing::warn!(
                    "⚠️ Step {} of '{}' failed, emitting {}: {error}",
                    meta.name,
                    instance.reference_id,
                    failure
                );
                Ok(Some(
                    WorkflowEvent::new(failure.clone())
                        .with("error", error.to_string())
                        .with("step", meta.name.clone())
                        .with("retries", attempts)
                        .with_source(&meta.name),
                ))
            }
            None => {
                tracing::error!(
                    "❌ Workflow '{}' failed at {}: {error}",
                    instance.reference_id,
                    meta.name
                );
                instance.fail(error.to_string());
                self.persist(instance)?;
                Ok(None)
            }
        }
    }

    /// min(2^attempt s, cap).
    fn retry_backoff(&self, attempt: u32) -> Duration {
        let secs = 2u64
            .saturating_pow(attempt)
            .min(self.config.retry_backoff_cap_secs);
        Duration::from_secs(secs)
    }

    /// Follow `event`'s transition and record it. Returns true when the new
    /// current step should run right away.
    fn apply_event(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        event: WorkflowEvent,
    ) -> Result<bool> {
        let from = instance.current_step.clone();

        let Some(transition) = definition.transition(&from, &event.event_type) else {
            let msg = format!("No transition from step '{from}' on event '{}'", event.event_type);
            tracing::error!("❌ Workflow '{}': {}", instance.reference_id, msg);
            instance.fail(msg);
            if self.persist(instance)? {
                self.store.save_event(&instance.reference_id, &event)?;
            }
            return Ok(false);
        };

        instance.current_step = transition.to.clone();
        match transition.terminal {
            Some(TerminalStatus::Completed) => instance.finish(WorkflowStatus::Completed),
            Some(TerminalStatus::Failed) => {
                let msg = event.error().map(str::to_string).unwrap_or_else(|| {
                    format!("workflow failed at '{from}' on '{}'", event.event_type)
                });
                instance.fail(msg);
            }
            None => instance.touch(),
        }
        if !self.persist(instance)? {
            return Ok(false);
        }
        self.store.save_event(&instance.reference_id, &event)?;

        match transition.terminal {
            Some(TerminalStatus::Completed) => {
                tracing::info!(
                    "✅ Workflow '{}' completed at {}",
                    instance.reference_id,
                    instance.current_step
                );
                Ok(false)
            }
            Some(TerminalStatus::Failed) => {
                tracing::warn!(
                    "🔥 Workflow '{}' failed at {}: {}",
                    instance.reference_id,
                    instance.current_step,
                    instance.error_message.as_deref().unwrap_or_default()
                );
                Ok(false)
            }
            None => {
                tracing::info!(
                    "➡️ Workflow '{}': {} --{}--> {}",
                    instance.reference_id,
                    from,
                    event.event_type,
                    instance.current_step
                );
                Ok(true)
            }
        }
    }

    /// Write back an instance the engine is executing. Returns false when it
    /// was stopped (cancelled, deleted) meanwhile; `instance` then takes the
    /// stored copy so nothing else runs on it.
    fn persist(&self, instance: &mut WorkflowInstance) -> Result<bool> {
        if self.store.update_running(instance)? {
            return Ok(true);
        }
        tracing::warn!(
            "🛑 Workflow '{}' was stopped while a step ran, discarding its update",
            instance.reference_id
        );
        match self.store.get_instance(&instance.reference_id)? {
            Some(stored) => *instance = stored,
            None => instance.finish(WorkflowStatus::Cancelled),
        }
        Ok(false)
    }

    // ─── Operator actions ─────────────────────────────────────

    /// Feed an event into a finished instance, e.g. a manual retry request.
    ///
    /// Allowed for FAILED instances, and for COMPLETED ones resting on the
    /// definition's failure marker step.
    pub async fn process_event(
        &self,
        reference_id: &str,
        event: WorkflowEvent,
        operator: Option<&str>,
    ) -> Result<WorkflowInstance> {
        let mut instance = self.require_instance(reference_id)?;
        let definition = self.definition(&instance.workflow_name)?;
        let reopenable = match instance.status {
            WorkflowStatus::Failed => true,
            WorkflowStatus::Completed => definition.is_failure_marker(&instance.current_step),
            _ => false,
        };
        if !reopenable {
            return Err(JobflowError::InvalidState(format!(
                "workflow '{}' is {} at {}; only failed workflows accept events",
                reference_id, instance.status, instance.current_step
            )));
        }

        tracing::info!(
            "🔁 Workflow '{}' re-entered at {} with {}",
            reference_id,
            instance.current_step,
            event.event_type
        );
        instance.reopen(operator);
        self.store.save_instance(&instance)?;
        if self.apply_event(&definition, &mut instance, event)? {
            self.execute_current_step(&mut instance).await?;
        }
        Ok(instance)
    }

    /// Run the current step of a FAILED instance again.
    pub async fn retry_workflow(&self, reference_id: &str, operator: Option<&str>) -> Result<WorkflowInstance> {
        let mut instance = self.require_instance(reference_id)?;
        if instance.status != WorkflowStatus::Failed {
            return Err(JobflowError::InvalidState(format!(
                "only FAILED workflows can be retried; '{}' is {}",
                reference_id, instance.status
            )));
        }
        let definition = self.definition(&instance.workflow_name)?;
        if let Some(step) = definition.step(&instance.current_step) {
            instance.remove_variable(&step.meta().retry_key());
        }
        instance.reopen(operator);
        self.store.save_instance(&instance)?;
        tracing::info!("🔁 Retrying workflow '{}' at {}", reference_id, instance.current_step);
        self.execute_current_step(&mut instance).await?;
        Ok(instance)
    }

    /// Stop a RUNNING instance. A continuation job still queued for it finds
    /// the instance terminal and does nothing, and a step already in flight
    /// cannot write it back to RUNNING.
    pub fn cancel_workflow(&self, reference_id: &str, operator: Option<&str>) -> Result<WorkflowInstance> {
        let mut instance = self.require_instance(reference_id)?;
        if instance.status != WorkflowStatus::Running {
            return Err(JobflowError::InvalidState(format!(
                "cannot stop a workflow that is not running; '{}' is {}",
                reference_id, instance.status
            )));
        }
        instance.current_step = EventType::WORKFLOW_CANCELLED.as_str().to_string();
        if let Some(op) = operator {
            instance.last_modified_by = Some(op.to_string());
        }
        instance.finish(WorkflowStatus::Cancelled);
        if !self.store.update_running(&instance)? {
            return Err(JobflowError::InvalidState(format!(
                "workflow '{reference_id}' stopped before it could be cancelled"
            )));
        }
        self.store.save_event(
            reference_id,
            &WorkflowEvent::new(EventType::WORKFLOW_CANCELLED).with_source(operator.unwrap_or("operator")),
        )?;
        tracing::info!("🛑 Workflow '{}' cancelled", reference_id);
        Ok(instance)
    }

    /// Remove an instance and its history. Rejected while RUNNING.
    pub fn delete_workflow(&self, reference_id: &str) -> Result<()> {
        let instance = self.require_instance(reference_id)?;
        if instance.status == WorkflowStatus::Running {
            return Err(JobflowError::InvalidState(format!(
                "cannot delete running workflow '{reference_id}'"
            )));
        }
        self.store.delete_instance(reference_id)?;
        tracing::info!("🗑️ Workflow '{}' deleted", reference_id);
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────

    pub fn get_instance(&self, reference_id: &str) -> Result<Option<WorkflowInstance>> {
        self.store.get_instance(reference_id)
    }

    fn require_instance(&self, reference_id: &str) -> Result<WorkflowInstance> {
        self.store
            .get_instance(reference_id)?
            .ok_or_else(|| JobflowError::NotFound(format!("workflow instance '{reference_id}'")))
    }

    pub fn get_all_instances(&self) -> Result<Vec<WorkflowInstance>> {
        self.store.list_instances()
    }

    pub fn instances_by_status(&self, status: WorkflowStatus) -> Result<Vec<WorkflowInstance>> {
        self.store.instances_by_status(status)
    }

    pub fn recent_instances(&self, limit: usize) -> Result<Vec<WorkflowInstance>> {
        self.store.recent_instances(limit)
    }

    pub fn events_for(&self, reference_id: &str) -> Result<Vec<WorkflowEvent>> {
        self.store.events_for(reference_id)
    }

    pub fn statistics(&self) -> Result<WorkflowStats> {
        self.store.statistics()
    }
}
