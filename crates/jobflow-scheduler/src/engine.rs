//! Job scheduler — the single owned entry point for scheduling work.
//! Wires the job store, task registry, runner, delay queue and dispatcher
//! together and gives them an explicit start/stop lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use jobflow_core::{JobflowError, Result, SchedulerConfig};
use tokio::task::JoinHandle;

use crate::delay::DelayQueue;
use crate::dispatch;
use crate::job::{Job, JobId};
use crate::persistence::JobStore;
use crate::recurrence;
use crate::runner::{JobRunner, RunOutcome};
use crate::tasks::TaskRegistry;

/// Durable job scheduler.
///
/// Jobs reach the delay queue either directly on creation (fast path, only
/// when the sweep is disabled) or through the dispatcher sweep. Either way
/// execution starts with a claim on the job row, so a job queued twice still
/// runs once per fire time.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    runner: JobRunner,
    queue: DelayQueue,
    config: SchedulerConfig,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl JobScheduler {
    /// Create a scheduler with an empty task registry.
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>) -> Arc<Self> {
        Self::with_registry(config, store, Arc::new(TaskRegistry::new()))
    }

    pub fn with_registry(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
    ) -> Arc<Self> {
        let runner = JobRunner::new(Arc::clone(&store), Arc::clone(&registry), config.clone());
        Arc::new(Self {
            store,
            registry,
            runner,
            queue: DelayQueue::new(),
            config,
            dispatcher: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist a job and return its ID.
    ///
    /// The task only has to be registered by the time the job fires. Fire
    /// times in the past are clamped to now.
    pub fn schedule_job(
        self: &Arc<Self>,
        task_name: &str,
        payload: &str,
        fire_at: DateTime<Utc>,
        interval_days: u32,
        is_recurring: bool,
    ) -> Result<JobId> {
        let fire_at = fire_at.max(Utc::now());
        let mut job = Job::new(task_name, payload, fire_at, interval_days, is_recurring)?;
        job.id = self.store.insert(&job)?;
        tracing::info!(
            "📅 Job {} scheduled: '{}' at {}{}",
            job.id,
            job.task_name,
            job.next_fire_at.to_rfc3339(),
            if job.recurs() {
                format!(" (every {} day(s))", job.interval_days)
            } else {
                String::new()
            }
        );
        if self.config.fast_path() {
            self.enqueue(job.id, job.next_fire_at);
        }
        Ok(job.id)
    }

    /// Schedule a one-shot job `delay` from now.
    pub fn schedule_after(self: &Arc<Self>, task_name: &str, payload: &str, delay: Duration) -> Result<JobId> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| JobflowError::Invalid(format!("delay out of range: {e}")))?;
        self.schedule_job(task_name, payload, Utc::now() + delay, 0, false)
    }

    /// Schedule a recurring job at `time_of_day` (`HH:MM`, UTC) every
    /// `interval_days`, starting from `start_date`.
    pub fn schedule_daily(
        self: &Arc<Self>,
        task_name: &str,
        payload: &str,
        start_date: NaiveDate,
        time_of_day: &str,
        interval_days: u32,
    ) -> Result<JobId> {
        let first = recurrence::next_fire_from_start(start_date, time_of_day, interval_days, Utc::now())?;
        self.schedule_job(task_name, payload, first, interval_days, interval_days > 0)
    }

    /// Remove a job. A queued entry for it becomes a no-op.
    pub fn delete_job(&self, id: JobId) -> Result<bool> {
        let removed = self.store.delete(id)?;
        if removed {
            tracing::info!("🗑️ Job {} deleted", id);
        }
        Ok(removed)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get(id)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list()
    }

    /// Callbacks waiting in the delay queue.
    pub fn pending_callbacks(&self) -> usize {
        self.queue.len()
    }

    /// Hand a job to the delay queue for its fire time.
    pub(crate) fn enqueue(self: &Arc<Self>, id: JobId, fire_at: DateTime<Utc>) {
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak = Arc::downgrade(self);
        self.queue.schedule(delay, async move {
            let Some(scheduler) = weak.upgrade() else {
                return Ok(());
            };
            scheduler.run_job(id, fire_at).await.map(|_| ())
        });
    }

    /// Run a fired job and requeue it if the runner asks for that.
    pub async fn run_job(self: &Arc<Self>, id: JobId, fire_at: DateTime<Utc>) -> Result<RunOutcome> {
        let outcome = self.runner.run(id, fire_at).await?;
        if let RunOutcome::Rescheduled {
            next_fire_at,
            requeue: true,
        } = &outcome
        {
            self.enqueue(id, *next_fire_at);
        }
        Ok(outcome)
    }

    /// Recover crashed state, start the workers and, if enabled, the sweep.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = dispatch::recover(self) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.queue.start(self.config.thread_count);
        let handle = if self.config.dispatcher_enabled {
            Some(dispatch::spawn_dispatcher(self))
        } else {
            dispatch::spawn_rescanner(self)
        };
        if let Ok(mut slot) = self.dispatcher.lock() {
            *slot = handle;
        }
        tracing::info!(
            "🚀 Job scheduler started ({} workers, {})",
            self.config.thread_count,
            if self.config.dispatcher_enabled { "sweep" } else { "fast path" }
        );
        Ok(())
    }

    /// Stop the sweep (or rescan) and the workers. Jobs stay in the store and are picked
    /// up again by the next `start`.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.dispatcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.queue.shutdown().await;
        tracing::info!("🛑 Job scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteJobStore;
    use crate::tasks::Task;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Record {
        seen: Arc<Mutex<Vec<(JobId, String)>>>,
    }

    #[async_trait]
    impl Task for Record {
        async fn run(&mut self, job: &Job) -> Result<()> {
            self.seen.lock().unwrap().push((job.id, job.payload.clone()));
            Ok(())
        }
    }

    fn fast_path() -> SchedulerConfig {
        SchedulerConfig {
            dispatcher_enabled: false,
            thread_count: 2,
            ..Default::default()
        }
    }

    fn recording(config: SchedulerConfig) -> (Arc<JobScheduler>, Arc<Mutex<Vec<(JobId, String)>>>) {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let scheduler = JobScheduler::new(config, store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        scheduler
            .registry()
            .register("record", move || Box::new(Record { seen: Arc::clone(&s) }))
            .unwrap();
        (scheduler, seen)
    }

    #[tokio::test]
    async fn test_one_shot_job_fires_once_and_is_removed() {
        let (scheduler, seen) = recording(fast_path());
        scheduler.start().unwrap();

        let fire_at = Utc::now() + chrono::Duration::milliseconds(1000);
        let id = scheduler.schedule_job("record", r#"{"x":1}"#, fire_at, 0, false).unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(seen.lock().unwrap().is_empty(), "fired too early");

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(id, r#"{"x":1}"#.to_string())]);
        assert!(scheduler.get_job(id).unwrap().is_none());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_late_registration_is_tolerated() {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let scheduler = JobScheduler::new(fast_path(), store);
        let id = scheduler
            .schedule_after("late", "", Duration::from_millis(150))
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        struct Late(Arc<AtomicUsize>);
        #[async_trait]
        impl Task for Late {
            async fn run(&mut self, _job: &Job) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let r = Arc::clone(&runs);
        scheduler
            .registry()
            .register("late", move || Box::new(Late(Arc::clone(&r))))
            .unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.get_job(id).unwrap().is_none());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_mode_does_not_enqueue_on_create() {
        let (scheduler, _) = recording(SchedulerConfig::default());
        scheduler.schedule_after("record", "", Duration::from_secs(1)).unwrap();
        assert_eq!(scheduler.pending_callbacks(), 0);
        assert_eq!(scheduler.list_jobs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_queue_entries_run_once() {
        let (scheduler, seen) = recording(fast_path());
        let id = scheduler.schedule_after("record", "dup", Duration::from_millis(50)).unwrap();
        let fire_at = scheduler.get_job(id).unwrap().unwrap().next_fire_at;
        // Simulate the sweep queueing an already fast-pathed job.
        scheduler.enqueue(id, fire_at);
        assert_eq!(scheduler.pending_callbacks(), 2);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_fast_path_picks_up_jobs_written_elsewhere() {
        let config = SchedulerConfig {
            rescan_interval_secs: 1,
            ..fast_path()
        };
        let (scheduler, seen) = recording(config);
        scheduler.start().unwrap();

        // Written straight to the store after start, as the CLI would.
        let job = Job::once("record", "from-cli", Utc::now()).unwrap();
        let id = scheduler.store().insert(&job).unwrap();
        assert_eq!(scheduler.pending_callbacks(), 0);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(id, "from-cli".to_string())]);
        assert!(scheduler.get_job(id).unwrap().is_none());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_recurring_job_survives_and_moves_forward() {
        let (scheduler, seen) = recording(fast_path());
        let id = scheduler.schedule_job("record", "", Utc::now(), 1, true).unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        let job = scheduler.get_job(id).unwrap().unwrap();
        assert!(job.next_fire_at > Utc::now() + chrono::Duration::hours(23));
        assert!(!job.is_running);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_schedule_daily_and_delete() {
        let (scheduler, _) = recording(SchedulerConfig::default());
        let start = Utc::now().date_naive();
        let id = scheduler.schedule_daily("record", "", start, "00:00", 1).unwrap();
        let job = scheduler.get_job(id).unwrap().unwrap();
        assert!(job.is_recurring);
        assert!(job.next_fire_at > Utc::now());

        assert!(scheduler.delete_job(id).unwrap());
        assert!(scheduler.get_job(id).unwrap().is_none());
        assert!(!scheduler.delete_job(id).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_recurring_job_rejected() {
        let (scheduler, _) = recording(SchedulerConfig::default());
        assert!(scheduler.schedule_job("record", "", Utc::now(), 0, true).is_err());
        assert!(scheduler.list_jobs().unwrap().is_empty());
    }
}
