//! # Jobflow Core
//!
//! Shared configuration and error types for the Jobflow workspace.

pub mod config;
pub mod error;

pub use config::{BuildConfig, JobflowConfig, SchedulerConfig, WorkflowConfig};
pub use error::{JobflowError, Result};
