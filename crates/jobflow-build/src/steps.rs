//! Build pipeline steps.
//!
//! Collaborator errors are returned as step errors so the engine's retry
//! and failure-event handling applies. Outcomes the build service reports
//! explicitly (a failed build, a missing build id) become failure events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::Result;
use jobflow_workflow::{
    EventType, LAST_ERROR_VAR, StepContext, StepMeta, WorkflowEvent, WorkflowInstance, WorkflowStep,
};

use crate::api::{BuildApi, BuildStatus};
use crate::events::{self, steps};
use crate::notify::{Notifier, announce};
use crate::products::{self, ProductStatus};

const BUILD_ID_VAR: &str = "buildId";
const MILESTONE_VAR: &str = "milestoneVersion";

/// Failure event carrying `error`, which is also kept for the failure step.
fn failure(instance: &mut WorkflowInstance, event: EventType, error: impl Into<String>) -> WorkflowEvent {
    let error = error.into();
    instance.set_variable(LAST_ERROR_VAR, error.clone());
    WorkflowEvent::new(event).with("error", error)
}

fn build_id(instance: &WorkflowInstance) -> Option<String> {
    instance
        .variable_str(BUILD_ID_VAR)
        .map(str::to_string)
        .or_else(|| products::current_product(instance).ok().and_then(|p| p.build_id))
}

// ─── Build ────────────────────────────────────────────────────

/// Starts a build for the current product.
pub struct BuildInitiationStep {
    meta: StepMeta,
    api: Arc<dyn BuildApi>,
    notifier: Arc<dyn Notifier>,
}

impl BuildInitiationStep {
    pub fn new(api: Arc<dyn BuildApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            meta: StepMeta::action(steps::BUILD_INITIATION)
                .description("Start a build for the current product")
                .timeout(Duration::from_secs(60))
                .max_retries(2)
                .failure_event(events::BUILD_FAILED),
            api,
            notifier,
        }
    }
}

#[async_trait]
impl WorkflowStep for BuildInitiationStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let product = match products::current_product(instance) {
            Ok(p) => p,
            Err(e) => return Ok(Some(failure(instance, events::BUILD_FAILED, e.to_string()))),
        };

        let handle = self
            .api
            .initiate_build(
                &product.name,
                products::is_patch_build(instance),
                products::branch_name(instance),
            )
            .await?;

        instance.set_variable(BUILD_ID_VAR, handle.build_id.clone());
        instance.remove_variable(MILESTONE_VAR);
        instance.remove_variable(LAST_ERROR_VAR);
        products::update_current(instance, |p| {
            p.status = ProductStatus::BuildStarted;
            p.build_id = Some(handle.build_id.clone());
            p.release_version = None;
            p.channel_url = None;
            p.error = None;
        })?;

        announce(
            self.notifier.as_ref(),
            &instance.reference_id,
            &format!("*[ {} ]* Build started", product.name),
        )
        .await;
        Ok(Some(
            WorkflowEvent::new(events::BUILD_STARTED)
                .with("buildId", handle.build_id)
                .with("message", handle.message),
        ))
    }
}

/// Polls the build until it finishes, suspending between polls.
pub struct BuildInProgressStep {
    meta: StepMeta,
    api: Arc<dyn BuildApi>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
}

impl BuildInProgressStep {
    pub fn new(api: Arc<dyn BuildApi>, notifier: Arc<dyn Notifier>, poll_interval: Duration) -> Self {
        Self {
            meta: StepMeta::action(steps::BUILD_IN_PROGRESS)
                .description("Poll the build service until the build finishes")
                .timeout(Duration::from_secs(60))
                .failure_event(events::BUILD_FAILED),
            api,
            notifier,
            poll_interval,
        }
    }
}

#[async_trait]
impl WorkflowStep for BuildInProgressStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let Some(build_id) = build_id(instance) else {
            return Ok(Some(failure(instance, events::BUILD_FAILED, "missing buildId")));
        };
        let name = instance
            .context_str(products::PRODUCT_NAME)
            .unwrap_or_default()
            .to_string();

        match self.api.build_status(&build_id).await? {
            BuildStatus::InProgress => {
                tracing::debug!(
                    "build {} of '{}' still running, next poll in {:?}",
                    build_id,
                    instance.reference_id,
                    self.poll_interval
                );
                ctx.resume_after(instance, self.poll_interval)?;
                Ok(None)
            }
            BuildStatus::Succeeded { release_version } => {
                products::update_current(instance, |p| {
                    p.status = ProductStatus::BuildSuccess;
                    p.release_version = release_version.clone();
                })?;
                announce(
                    self.notifier.as_ref(),
                    &instance.reference_id,
                    &format!("*[ {name} ]* Build success"),
                )
                .await;
                Ok(Some(
                    WorkflowEvent::new(events::BUILD_COMPLETED).with("buildId", build_id),
                ))
            }
            BuildStatus::Failed(reason) => {
                announce(
                    self.notifier.as_ref(),
                    &instance.reference_id,
                    &format!("*[ {name} ]* Build failed"),
                )
                .await;
                Ok(Some(failure(instance, events::BUILD_FAILED, reason)))
            }
        }
    }
}

/// Marks the current product built and moves on to the milestone.
pub struct BuildCompletedStep {
    meta: StepMeta,
}

impl BuildCompletedStep {
    pub fn new() -> Self {
        Self {
            meta: StepMeta::action(steps::BUILD_COMPLETED)
                .description("Record a successful build")
                .timeout(Duration::from_secs(10))
                .max_retries(0),
        }
    }
}

impl Default for BuildCompletedStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStep for BuildCompletedStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        products::update_current(instance, |p| p.status = ProductStatus::BuildSuccess)?;
        Ok(Some(WorkflowEvent::new(events::MILESTONE_CREATION)))
    }
}

// ─── Release ──────────────────────────────────────────────────

/// Reuses the build's release version or creates a milestone for it.
pub struct MilestoneCreationStep {
    meta: StepMeta,
    api: Arc<dyn BuildApi>,
    notifier: Arc<dyn Notifier>,
}

impl MilestoneCreationStep {
    pub fn new(api: Arc<dyn BuildApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            meta: StepMeta::action(steps::MILESTONE_CREATION)
                .description("Create a milestone for the completed build")
                .timeout(Duration::from_secs(120))
                .max_retries(0)
                .failure_event(events::MILESTONE_FAILED),
            api,
            notifier,
        }
    }
}

#[async_trait]
impl WorkflowStep for MilestoneCreationStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let product = products::current_product(instance)?;
        let Some(build_id) = build_id(instance) else {
            return Ok(Some(failure(instance, events::MILESTONE_FAILED, "missing buildId")));
        };

        let version = match product.release_version.clone() {
            Some(existing) => {
                tracing::info!(
                    "🏷️ {} already released as {}, reusing it",
                    product.name,
                    existing
                );
                announce(
                    self.notifier.as_ref(),
                    &instance.reference_id,
                    &format!("*[ {} ]* Milestone already available ( {existing} )", product.name),
                )
                .await;
                existing
            }
            None => {
                let created = self.api.create_milestone(&build_id, &product.name).await?;
                announce(
                    self.notifier.as_ref(),
                    &instance.reference_id,
                    &format!("*[ {} ]* Completed\n\nMilestone version: {created}", product.name),
                )
                .await;
                created
            }
        };

        products::update_current(instance, |p| {
            p.status = ProductStatus::MilestoneCreated;
            p.release_version = Some(version.clone());
        })?;
        instance.set_variable(MILESTONE_VAR, version.clone());
        Ok(Some(
            WorkflowEvent::new(events::CHANNEL_MAPPING).with(MILESTONE_VAR, version),
        ))
    }
}

/// Maps the milestone onto the product's release channel.
pub struct ChannelMappingStep {
    meta: StepMeta,
    api: Arc<dyn BuildApi>,
    notifier: Arc<dyn Notifier>,
}

impl ChannelMappingStep {
    pub fn new(api: Arc<dyn BuildApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            meta: StepMeta::action(steps::CHANNEL_MAPPING)
                .description("Map the milestone to the release channel")
                .timeout(Duration::from_secs(60))
                .max_retries(0)
                .failure_event(events::CHANNEL_FAILED),
            api,
            notifier,
        }
    }
}

#[async_trait]
impl WorkflowStep for ChannelMappingStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let product = products::current_product(instance)?;
        let version = instance
            .variable_str(MILESTONE_VAR)
            .map(str::to_string)
            .or_else(|| product.release_version.clone());
        let (Some(build_id), Some(version)) = (build_id(instance), version) else {
            return Ok(Some(failure(
                instance,
                events::CHANNEL_FAILED,
                "missing buildId or milestone version",
            )));
        };

        let channel_url = self.api.map_channel(&build_id, &version, &product.name).await?;
        products::update_current(instance, |p| {
            p.status = ProductStatus::ChannelMapped;
            p.channel_url = Some(channel_url.clone());
        })?;
        tracing::info!("📡 {} mapped to {}", product.name, channel_url);
        announce(
            self.notifier.as_ref(),
            &instance.reference_id,
            &format!("*[ {} ]* Released to {channel_url}", product.name),
        )
        .await;
        Ok(Some(
            WorkflowEvent::new(events::NEXT_PRODUCT).with("channelUrl", channel_url),
        ))
    }
}

// ─── Routing ──────────────────────────────────────────────────

/// Picks the next pending product, or finishes the pipeline.
pub struct NextProductStep {
    meta: StepMeta,
}

impl NextProductStep {
    pub fn new() -> Self {
        Self {
            meta: StepMeta::decision(steps::NEXT_PRODUCT)
                .description("Pick the next pending product or finish")
                .timeout(Duration::from_secs(10))
                .max_retries(0)
                .failure_event(events::WORKFLOW_FAILED),
        }
    }
}

impl Default for NextProductStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStep for NextProductStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        if products::monitor_id(instance).is_none() {
            return Ok(Some(failure(instance, events::WORKFLOW_FAILED, "Missing monitorId")));
        }

        match products::next_pending(instance)? {
            Some(next) => {
                products::select(instance, &next);
                instance.remove_variable(BUILD_ID_VAR);
                instance.remove_variable(MILESTONE_VAR);
                Ok(Some(
                    WorkflowEvent::new(events::BUILD_STARTED).with("nextProduct", next.name),
                ))
            }
            None => {
                let done = products::products(instance)?.len();
                Ok(Some(
                    WorkflowEvent::new(events::WORKFLOW_COMPLETED)
                        .with("message", "All products completed")
                        .with("products", done),
                ))
            }
        }
    }
}

/// Records a failure on the current product and fails the workflow.
/// One instance per failure step (build, milestone, channel).
pub struct ProductFailedStep {
    meta: StepMeta,
    status: ProductStatus,
    label: &'static str,
    notifier: Arc<dyn Notifier>,
}

impl ProductFailedStep {
    pub fn new(step: &str, status: ProductStatus, label: &'static str, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            meta: StepMeta::action(step)
                .description("Mark the current product failed")
                .timeout(Duration::from_secs(10))
                .max_retries(0),
            status,
            label,
            notifier,
        }
    }

    pub fn build(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(steps::BUILD_FAILED, ProductStatus::BuildFailed, "Build", notifier)
    }

    pub fn milestone(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(
            steps::MILESTONE_FAILED,
            ProductStatus::MilestoneFailed,
            "Milestone creation",
            notifier,
        )
    }

    pub fn channel(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(
            steps::CHANNEL_FAILED,
            ProductStatus::ChannelFailed,
            "Channel mapping",
            notifier,
        )
    }
}

#[async_trait]
impl WorkflowStep for ProductFailedStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let reason = instance
            .variable_str(LAST_ERROR_VAR)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} failed", self.label));

        let status = self.status;
        let product = products::update_current(instance, |p| {
            p.status = status;
            p.error = Some(reason.clone());
        })
        .ok();
        if let Some(product) = product {
            announce(
                self.notifier.as_ref(),
                &instance.reference_id,
                &format!("*[ {} ]* {} failed: {reason}", product.name, self.label),
            )
            .await;
        }

        Ok(Some(
            WorkflowEvent::new(events::WORKFLOW_FAILED)
                .with("error", format!("{} failed: {reason}", self.label)),
        ))
    }
}

/// Resting step for a pipeline that gave up outside a product action
/// (a missing monitor id, say). It only runs when an operator retries the
/// instance in place, and then fails it again with the recorded reason;
/// `RETRY_REQUESTED` is the way back into the pipeline.
pub struct WorkflowFailedStep {
    meta: StepMeta,
}

impl WorkflowFailedStep {
    pub fn new() -> Self {
        Self {
            meta: StepMeta::decision(steps::WORKFLOW_FAILED)
                .description("Workflow failed; awaiting a retry request")
                .timeout(Duration::from_secs(10))
                .max_retries(0),
        }
    }
}

impl Default for WorkflowFailedStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStep for WorkflowFailedStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    async fn execute(
        &self,
        _ctx: &StepContext,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowEvent>> {
        let reason = instance
            .variable_str(LAST_ERROR_VAR)
            .unwrap_or("Workflow failed")
            .to_string();
        Ok(Some(WorkflowEvent::new(events::WORKFLOW_FAILED).with("error", reason)))
    }
}
