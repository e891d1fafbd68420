//! The build pipeline definition and its entry point.

use std::sync::Arc;
use std::time::Duration;

use jobflow_core::{BuildConfig, Result};
use jobflow_workflow::{WorkflowDefinition, WorkflowEngine, WorkflowInstance};

use crate::api::{BuildApi, HttpBuildApi};
use crate::events::{self, steps};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::products::BuildRequest;
use crate::steps::{
    BuildCompletedStep, BuildInProgressStep, BuildInitiationStep, ChannelMappingStep,
    MilestoneCreationStep, NextProductStep, ProductFailedStep, WorkflowFailedStep,
};

/// Name the pipeline is registered under.
pub const BUILD_WORKFLOW: &str = "build-pipeline";

/// Assemble the pipeline:
///
/// ```text
/// BUILD_INITIATION ─► BUILD_IN_PROGRESS ─► BUILD_COMPLETED ─► MILESTONE_CREATION
///        ▲               (polls itself)                              │
///        │                                                           ▼
///        └──── BUILD_STARTED ──── NEXT_PRODUCT ◄──────────── CHANNEL_MAPPING
///                                   ├─ WORKFLOW_COMPLETED
///                                   └─ WORKFLOW_FAILED
/// ```
///
/// Each action has an `*_FAILED` step that fails the instance and accepts
/// `RETRY_REQUESTED` to go back to the step that failed. A run that failed
/// at `WORKFLOW_FAILED` restarts the current product from `BUILD_INITIATION`.
pub fn build_workflow(
    api: Arc<dyn BuildApi>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
) -> Result<WorkflowDefinition> {
    WorkflowDefinition::builder(BUILD_WORKFLOW)
        .initial_step(steps::BUILD_INITIATION)
        .step(BuildInitiationStep::new(Arc::clone(&api), Arc::clone(&notifier)))
        .step(BuildInProgressStep::new(
            Arc::clone(&api),
            Arc::clone(&notifier),
            poll_interval,
        ))
        .step(BuildCompletedStep::new())
        .step(MilestoneCreationStep::new(Arc::clone(&api), Arc::clone(&notifier)))
        .step(ChannelMappingStep::new(api, Arc::clone(&notifier)))
        .step(NextProductStep::new())
        .step(ProductFailedStep::build(Arc::clone(&notifier)))
        .step(ProductFailedStep::milestone(Arc::clone(&notifier)))
        .step(ProductFailedStep::channel(notifier))
        .step(WorkflowFailedStep::new())
        // happy path
        .transition(steps::BUILD_INITIATION, events::BUILD_STARTED, steps::BUILD_IN_PROGRESS)
        .transition(steps::BUILD_IN_PROGRESS, events::BUILD_COMPLETED, steps::BUILD_COMPLETED)
        .transition(steps::BUILD_IN_PROGRESS, events::BUILD_STATUS_CHECK, steps::BUILD_IN_PROGRESS)
        .transition(steps::BUILD_COMPLETED, events::MILESTONE_CREATION, steps::MILESTONE_CREATION)
        .transition(steps::MILESTONE_CREATION, events::CHANNEL_MAPPING, steps::CHANNEL_MAPPING)
        .transition(steps::CHANNEL_MAPPING, events::NEXT_PRODUCT, steps::NEXT_PRODUCT)
        .transition(steps::NEXT_PRODUCT, events::BUILD_STARTED, steps::BUILD_INITIATION)
        .complete_on(steps::NEXT_PRODUCT, events::WORKFLOW_COMPLETED, steps::WORKFLOW_COMPLETED)
        .fail_on(steps::NEXT_PRODUCT, events::WORKFLOW_FAILED, steps::WORKFLOW_FAILED)
        // failures
        .transition(steps::BUILD_INITIATION, events::BUILD_FAILED, steps::BUILD_FAILED)
        .transition(steps::BUILD_IN_PROGRESS, events::BUILD_FAILED, steps::BUILD_FAILED)
        .transition(steps::MILESTONE_CREATION, events::MILESTONE_FAILED, steps::MILESTONE_FAILED)
        .transition(steps::CHANNEL_MAPPING, events::CHANNEL_FAILED, steps::CHANNEL_FAILED)
        .fail_on(steps::BUILD_FAILED, events::WORKFLOW_FAILED, steps::BUILD_FAILED)
        .fail_on(steps::MILESTONE_FAILED, events::WORKFLOW_FAILED, steps::MILESTONE_FAILED)
        .fail_on(steps::CHANNEL_FAILED, events::WORKFLOW_FAILED, steps::CHANNEL_FAILED)
        .fail_on(steps::WORKFLOW_FAILED, events::WORKFLOW_FAILED, steps::WORKFLOW_FAILED)
        // operator retries
        .transition(steps::BUILD_FAILED, events::RETRY_REQUESTED, steps::BUILD_INITIATION)
        .transition(steps::MILESTONE_FAILED, events::RETRY_REQUESTED, steps::MILESTONE_CREATION)
        .transition(steps::CHANNEL_FAILED, events::RETRY_REQUESTED, steps::CHANNEL_MAPPING)
        .transition(steps::WORKFLOW_FAILED, events::RETRY_REQUESTED, steps::BUILD_INITIATION)
        .failure_marker(steps::WORKFLOW_FAILED)
        .build()
}

/// Pipeline wired to the HTTP build service and the configured notifier.
pub fn from_config(config: &BuildConfig) -> Result<WorkflowDefinition> {
    let api: Arc<dyn BuildApi> = Arc::new(HttpBuildApi::from_config(config)?);
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
        Some(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.http_timeout_secs),
        )?),
        _ => Arc::new(LogNotifier),
    };
    build_workflow(api, notifier, Duration::from_secs(config.poll_interval_secs))
}

/// Start a pipeline run for `request` under `reference_id`.
pub fn start_build(
    engine: &WorkflowEngine,
    reference_id: &str,
    request: BuildRequest,
    initiator: Option<&str>,
) -> Result<WorkflowInstance> {
    let context = request.into_context()?;
    engine.schedule_workflow(BUILD_WORKFLOW, reference_id, context, initiator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BuildHandle, BuildStatus};
    use crate::products::{self, ProductStatus};
    use async_trait::async_trait;
    use jobflow_core::{JobflowError, SchedulerConfig, WorkflowConfig};
    use jobflow_scheduler::{JobScheduler, SqliteJobStore};
    use jobflow_workflow::{SqliteWorkflowStore, WorkflowEvent, WorkflowStatus};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted build service: status polls pop from `statuses`.
    #[derive(Default)]
    struct FakeApi {
        statuses: Mutex<VecDeque<BuildStatus>>,
        started: AtomicUsize,
        milestone_fails: bool,
        channels: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuildApi for FakeApi {
        async fn initiate_build(&self, product: &str, _patch: bool, _branch: Option<&str>) -> Result<BuildHandle> {
            let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BuildHandle {
                build_id: format!("{product}-{n}"),
                message: "queued".into(),
            })
        }

        async fn build_status(&self, _build_id: &str) -> Result<BuildStatus> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(BuildStatus::Succeeded { release_version: None }))
        }

        async fn create_milestone(&self, build_id: &str, _product: &str) -> Result<String> {
            if self.milestone_fails {
                return Err(JobflowError::Http("milestone service down".into()));
            }
            Ok(format!("m-{build_id}"))
        }

        async fn map_channel(&self, _build_id: &str, version: &str, product: &str) -> Result<String> {
            let url = format!("https://channels.example.com/{product}/{version}");
            self.channels.lock().unwrap().push(url.clone());
            Ok(url)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, _reference_id: &str, message: &str) -> Result<()> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine>,
        scheduler: Arc<JobScheduler>,
        api: Arc<FakeApi>,
        notes: Arc<Recorder>,
    }

    fn harness(api: FakeApi) -> Harness {
        let jobs = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let scheduler = JobScheduler::new(SchedulerConfig::default(), jobs);
        let store = Arc::new(SqliteWorkflowStore::open_in_memory().unwrap());
        let engine = WorkflowEngine::new(Arc::clone(&scheduler), store, WorkflowConfig::default()).unwrap();
        let api = Arc::new(api);
        let notes = Arc::new(Recorder::default());
        let def = build_workflow(api.clone(), notes.clone(), Duration::from_secs(30)).unwrap();
        engine.register_workflow(def).unwrap();
        Harness {
            engine,
            scheduler,
            api,
            notes,
        }
    }

    fn request(products: &[&str]) -> BuildRequest {
        BuildRequest {
            monitor_id: 7,
            products: products.iter().map(|p| p.to_string()).collect(),
            is_patch_build: false,
            branch_name: None,
        }
    }

    async fn step(h: &Harness, reference: &str) -> WorkflowInstance {
        let mut inst = h.engine.get_instance(reference).unwrap().unwrap();
        h.engine.execute_current_step(&mut inst).await.unwrap();
        inst
    }

    #[test]
    fn test_definition_shape() {
        let def = build_workflow(
            Arc::new(FakeApi::default()),
            Arc::new(LogNotifier),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(def.initial_step(), steps::BUILD_INITIATION);
        assert_eq!(def.step_names().len(), 10);
        assert_eq!(def.transitions().len(), 21);
        assert!(def.is_failure_marker(steps::WORKFLOW_FAILED));
        let retry = def
            .transition(steps::MILESTONE_FAILED, &events::RETRY_REQUESTED)
            .unwrap();
        assert_eq!(retry.to, steps::MILESTONE_CREATION);
        let restart = def
            .transition(steps::WORKFLOW_FAILED, &events::RETRY_REQUESTED)
            .unwrap();
        assert_eq!(restart.to, steps::BUILD_INITIATION);
    }

    #[tokio::test]
    async fn test_two_products_build_to_completion() {
        let h = harness(FakeApi {
            statuses: Mutex::new(VecDeque::from([
                BuildStatus::InProgress,
                BuildStatus::Succeeded {
                    release_version: Some("9.0.1".into()),
                },
            ])),
            ..Default::default()
        });
        start_build(&h.engine, "mb-1", request(&["desk", "mobile"]), Some("rel@corp")).unwrap();

        let polling = step(&h, "mb-1").await;
        assert_eq!(polling.status, WorkflowStatus::Running);
        assert_eq!(polling.current_step, steps::BUILD_IN_PROGRESS);
        assert_eq!(polling.variable_str("buildId"), Some("desk-1"));
        // kickoff job + first poll
        assert_eq!(h.scheduler.list_jobs().unwrap().len(), 2);

        let done = step(&h, "mb-1").await;
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.current_step, steps::WORKFLOW_COMPLETED);

        let queue = products::products(&done).unwrap();
        assert!(queue.iter().all(|p| p.status == ProductStatus::ChannelMapped));
        assert_eq!(queue[0].release_version.as_deref(), Some("9.0.1"));
        assert_eq!(queue[1].release_version.as_deref(), Some("m-mobile-2"));
        assert_eq!(h.api.started.load(Ordering::SeqCst), 2);
        assert_eq!(h.api.channels.lock().unwrap().len(), 2);
        assert!(
            h.notes
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.contains("Milestone already available ( 9.0.1 )"))
        );
    }

    #[tokio::test]
    async fn test_failed_build_fails_workflow_and_can_be_retried() {
        let h = harness(FakeApi {
            statuses: Mutex::new(VecDeque::from([BuildStatus::Failed("compile error".into())])),
            ..Default::default()
        });
        start_build(&h.engine, "mb-2", request(&["desk"]), None).unwrap();

        let failed = step(&h, "mb-2").await;
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.current_step, steps::BUILD_FAILED);
        assert_eq!(failed.error_message.as_deref(), Some("Build failed: compile error"));
        let product = products::current_product(&failed).unwrap();
        assert_eq!(product.status, ProductStatus::BuildFailed);
        assert_eq!(product.error.as_deref(), Some("compile error"));

        let retried = h
            .engine
            .process_event("mb-2", WorkflowEvent::new(events::RETRY_REQUESTED), Some("oncall"))
            .await
            .unwrap();
        assert_eq!(retried.status, WorkflowStatus::Completed);
        assert_eq!(retried.current_step, steps::WORKFLOW_COMPLETED);
        assert_eq!(h.api.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_milestone_error_routes_to_milestone_failed() {
        let h = harness(FakeApi {
            milestone_fails: true,
            ..Default::default()
        });
        start_build(&h.engine, "mb-3", request(&["desk"]), None).unwrap();

        let failed = step(&h, "mb-3").await;
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.current_step, steps::MILESTONE_FAILED);
        assert!(failed.error_message.as_deref().unwrap().contains("milestone service down"));
        assert_eq!(
            products::current_product(&failed).unwrap().status,
            ProductStatus::MilestoneFailed
        );
    }

    #[tokio::test]
    async fn test_missing_monitor_id_fails_at_next_product() {
        let h = harness(FakeApi::default());
        let mut ctx = request(&["desk"]).into_context().unwrap();
        ctx.as_object_mut().unwrap().remove(products::MONITOR_ID);
        h.engine
            .schedule_workflow(BUILD_WORKFLOW, "mb-4", ctx, None)
            .unwrap();

        let failed = step(&h, "mb-4").await;
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.current_step, steps::WORKFLOW_FAILED);
        assert_eq!(failed.error_message.as_deref(), Some("Missing monitorId"));
    }

    #[tokio::test]
    async fn test_workflow_failed_accepts_retry_request() {
        let h = harness(FakeApi::default());
        let mut ctx = request(&["desk"]).into_context().unwrap();
        ctx.as_object_mut().unwrap().remove(products::MONITOR_ID);
        h.engine
            .schedule_workflow(BUILD_WORKFLOW, "mb-5", ctx, None)
            .unwrap();
        assert_eq!(step(&h, "mb-5").await.current_step, steps::WORKFLOW_FAILED);

        let retried = h
            .engine
            .process_event("mb-5", WorkflowEvent::new(events::RETRY_REQUESTED), Some("oncall"))
            .await
            .unwrap();
        // Back through the whole product; the context still lacks a monitor id.
        assert_eq!(h.api.started.load(Ordering::SeqCst), 2);
        assert_eq!(retried.status, WorkflowStatus::Failed);
        assert_eq!(retried.current_step, steps::WORKFLOW_FAILED);

        let history: Vec<String> = h
            .engine
            .events_for("mb-5")
            .unwrap()
            .iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect();
        let retry_at = history.iter().position(|e| e == "RETRY_REQUESTED").unwrap();
        assert_eq!(history[retry_at + 1], "BUILD_STARTED");

        // Retrying in place re-fails with the recorded reason instead of hanging.
        let again = h.engine.retry_workflow("mb-5", None).await.unwrap();
        assert_eq!(again.status, WorkflowStatus::Failed);
        assert_eq!(again.error_message.as_deref(), Some("Missing monitorId"));
    }
}
