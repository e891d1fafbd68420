//! Task contract and the name → factory registry the runner resolves jobs with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jobflow_core::{JobflowError, Result};

use crate::job::Job;

/// Default delay before a continuing task runs again.
pub const DEFAULT_RUN_AGAIN_DELAY: Duration = Duration::from_secs(5 * 60);

/// The unit of work a job fires.
///
/// A fresh instance is built for every run, so a task may record state in
/// `run` (e.g. "the build is still pending") and report it through
/// [`Task::can_run_again`] afterwards.
#[async_trait]
pub trait Task: Send {
    async fn run(&mut self, job: &Job) -> Result<()>;

    /// Ask the runner to keep the job and fire it again after
    /// [`Task::delay_before_run_again`].
    fn can_run_again(&self) -> bool {
        false
    }

    fn delay_before_run_again(&self) -> Duration {
        DEFAULT_RUN_AGAIN_DELAY
    }
}

/// Builds a task instance for one run.
pub type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;

/// Registry of task factories keyed by task name.
///
/// Registration may happen after jobs for the name were scheduled; only the
/// lookup at fire time matters.
pub struct TaskRegistry {
    factories: RwLock<HashMap<String, TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory. Empty and duplicate names are configuration errors.
    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(JobflowError::Config("task name must not be empty".into()));
        }
        let mut factories = self
            .factories
            .write()
            .map_err(|e| JobflowError::Other(format!("task registry lock poisoned: {e}")))?;
        if factories.contains_key(name) {
            return Err(JobflowError::Config(format!(
                "task '{name}' is already registered"
            )));
        }
        factories.insert(name.to_string(), Arc::new(factory));
        tracing::info!("🧩 Task registered: '{}'", name);
        Ok(())
    }

    /// Build a fresh task for `name`, if registered.
    pub fn create(&self, name: &str) -> Option<Box<dyn Task>> {
        let factory = self.factories.read().ok()?.get(name).cloned()?;
        Some(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .map(|f| f.contains_key(name))
            .unwrap_or(false)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.factories.read().map(|f| f.len()).unwrap_or(0)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Noop;

    #[async_trait]
    impl Task for Noop {
        async fn run(&mut self, _job: &Job) -> Result<()> {
            Ok(())
        }
    }

    struct Poller {
        pending: bool,
    }

    #[async_trait]
    impl Task for Poller {
        async fn run(&mut self, job: &Job) -> Result<()> {
            self.pending = job.payload == "pending";
            Ok(())
        }

        fn can_run_again(&self) -> bool {
            self.pending
        }

        fn delay_before_run_again(&self) -> Duration {
            Duration::from_secs(30)
        }
    }

    #[test]
    fn test_register_and_create() {
        let registry = TaskRegistry::new();
        registry.register("noop", || Box::new(Noop)).unwrap();
        assert!(registry.contains("noop"));
        assert!(registry.create("noop").is_some());
        assert!(registry.create("missing").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_rejects_duplicate_and_empty_names() {
        let registry = TaskRegistry::new();
        registry.register("noop", || Box::new(Noop)).unwrap();
        let dup = registry.register("noop", || Box::new(Noop)).unwrap_err();
        assert!(matches!(dup, JobflowError::Config(_)));
        assert!(registry.register("", || Box::new(Noop)).is_err());
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }

    #[tokio::test]
    async fn test_defaults_and_stateful_continuation() {
        let noop = Noop;
        assert!(!noop.can_run_again());
        assert_eq!(noop.delay_before_run_again(), DEFAULT_RUN_AGAIN_DELAY);

        let registry = TaskRegistry::new();
        registry
            .register("poll", || Box::new(Poller { pending: false }))
            .unwrap();
        let job = Job::once("poll", "pending", Utc::now()).unwrap();
        let mut task = registry.create("poll").unwrap();
        task.run(&job).await.unwrap();
        assert!(task.can_run_again());
        assert_eq!(task.delay_before_run_again(), Duration::from_secs(30));

        // Each run starts from a clean instance.
        assert!(!registry.create("poll").unwrap().can_run_again());
    }
}
