//! Job runner — executes the task bound to a fired job and decides its fate.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use jobflow_core::{Result, SchedulerConfig};

use crate::job::{JobId, truncate_millis};
use crate::persistence::JobStore;
use crate::recurrence::next_recurring_fire;
use crate::tasks::TaskRegistry;

/// What happened to a job after it fired.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another runner owns the job, or it moved since it was queued.
    Skipped,
    /// The job is terminal and stays in the store with its error.
    Abandoned,
    /// One-shot job finished and was removed.
    Deleted,
    /// The job stays and fires again at `next_fire_at`. `requeue` tells the
    /// caller to hand it straight back to the delay queue.
    Rescheduled {
        next_fire_at: DateTime<Utc>,
        requeue: bool,
    },
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    config: SchedulerConfig,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<TaskRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Run job `id`, which was queued for `expected_fire_at`.
    ///
    /// Task failures (errors and panics) are logged and recorded on the job;
    /// they never abort continuation handling. Only store errors propagate.
    pub async fn run(&self, id: JobId, expected_fire_at: DateTime<Utc>) -> Result<RunOutcome> {
        let Some(job) = self.store.claim(id, expected_fire_at)? else {
            tracing::debug!("job {} already claimed or moved, skipping", id);
            return Ok(RunOutcome::Skipped);
        };

        let Some(mut task) = self.registry.create(&job.task_name) else {
            let msg = format!("no task registered as '{}'", job.task_name);
            tracing::error!("❌ Job {} abandoned: {}", job.id, msg);
            self.store.abandon(job.id, &msg)?;
            return Ok(RunOutcome::Abandoned);
        };

        tracing::info!("▶️ Running job {} ('{}')", job.id, job.task_name);
        let error = match AssertUnwindSafe(task.run(&job)).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Job {} ('{}') failed: {e}", job.id, job.task_name);
                Some(e.to_string())
            }
            Err(_) => {
                tracing::error!("💥 Job {} ('{}') panicked", job.id, job.task_name);
                Some(format!("task '{}' panicked", job.task_name))
            }
        };

        let now = Utc::now();
        if job.recurs()
            && let Some(next) = next_recurring_fire(job.next_fire_at, job.interval_days, now)
        {
            self.store.reschedule(job.id, next, error.as_deref())?;
            tracing::info!("🔁 Job {} next fires at {}", job.id, next.to_rfc3339());
            return Ok(RunOutcome::Rescheduled {
                next_fire_at: next,
                requeue: self.config.fast_path(),
            });
        }

        if task.can_run_again() {
            let delay = chrono::Duration::from_std(task.delay_before_run_again())
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
            let next = truncate_millis(now + delay);
            self.store.reschedule(job.id, next, error.as_deref())?;
            tracing::info!(
                "⏳ Job {} continues in {}s",
                job.id,
                delay.num_seconds()
            );
            return Ok(RunOutcome::Rescheduled {
                next_fire_at: next,
                requeue: true,
            });
        }

        if let Some(e) = error.filter(|_| self.config.keep_failed_jobs) {
            self.store.abandon(job.id, &e)?;
            return Ok(RunOutcome::Abandoned);
        }

        self.store.delete(job.id)?;
        tracing::debug!("job {} finished and removed", job.id);
        Ok(RunOutcome::Deleted)
    }
}
