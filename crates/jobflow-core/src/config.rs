//! Jobflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{JobflowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobflowConfig {
    /// SQLite file holding jobs, workflow instances and event history.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

fn default_database_path() -> String {
    "~/.jobflow/jobflow.db".into()
}

impl Default for JobflowConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            workflow: WorkflowConfig::default(),
            build: BuildConfig::default(),
        }
    }
}

impl JobflowConfig {
    /// Load config from the default path (~/.jobflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| JobflowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| JobflowError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| JobflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.thread_count == 0 {
            return Err(JobflowError::Config(
                "scheduler.thread_count must be at least 1".into(),
            ));
        }
        if self.scheduler.dispatcher_enabled && self.scheduler.dispatcher_interval_secs == 0 {
            return Err(JobflowError::Config(
                "scheduler.dispatcher_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Jobflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".jobflow")
    }
}

/// Job scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Workers draining the delay queue.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// When false, jobs go straight to the delay queue on creation.
    #[serde(default = "bool_true")]
    pub dispatcher_enabled: bool,
    #[serde(default = "default_dispatcher_interval")]
    pub dispatcher_interval_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub dispatcher_initial_delay_secs: u64,
    /// How far ahead of now each sweep loads jobs.
    #[serde(default = "default_look_ahead")]
    pub look_ahead_secs: u64,
    /// Keep failed one-shot jobs as abandoned records instead of deleting them.
    #[serde(default)]
    pub keep_failed_jobs: bool,
    /// Fast path only: how often to look for overdue jobs written by another
    /// process (the CLI, say). 0 turns the rescan off.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
}

fn default_thread_count() -> usize { 4 }
fn bool_true() -> bool { true }
fn default_dispatcher_interval() -> u64 { 300 }
fn default_initial_delay() -> u64 { 10 }
fn default_look_ahead() -> u64 { 300 }
fn default_rescan_interval() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            dispatcher_enabled: true,
            dispatcher_interval_secs: default_dispatcher_interval(),
            dispatcher_initial_delay_secs: default_initial_delay(),
            look_ahead_secs: default_look_ahead(),
            keep_failed_jobs: false,
            rescan_interval_secs: default_rescan_interval(),
        }
    }
}

impl SchedulerConfig {
    /// Whether newly created jobs bypass the sweep.
    pub fn fast_path(&self) -> bool {
        !self.dispatcher_enabled
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on the exponential step retry backoff.
    #[serde(default = "default_backoff_cap")]
    pub retry_backoff_cap_secs: u64,
    /// Recorded as `created_by` when callers don't name an initiator.
    #[serde(default = "default_initiator")]
    pub default_initiator: String,
}

fn default_backoff_cap() -> u64 { 30 }
fn default_initiator() -> String { "system".into() }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry_backoff_cap_secs: default_backoff_cap(),
            default_initiator: default_initiator(),
        }
    }
}

/// Build pipeline collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Base URL of the build service. Empty disables the build workflow.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Webhook receiving pipeline notifications.
    #[serde(default)]
    pub notify_webhook: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_poll_interval() -> u64 { 30 }
fn default_http_timeout() -> u64 { 30 }

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_token: None,
            notify_webhook: None,
            poll_interval_secs: default_poll_interval(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl BuildConfig {
    pub fn enabled(&self) -> bool {
        !self.api_url.trim().is_empty()
    }
}
