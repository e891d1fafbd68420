//! # Jobflow Scheduler
//!
//! Durable, crash-recoverable job scheduler.
//!
//! ## Design Principles
//! - SQLite is the source of truth — the in-memory queue is only a cache
//! - A periodic sweep refills the queue, which is how jobs survive restarts
//! - Every execution claims its job row first, so duplicate queue entries are harmless
//! - Tasks are resolved by name at fire time, never at schedule time
//!
//! ## Architecture
//! ```text
//! JobScheduler
//!   ├── schedule_job ──► JobStore (SQLite)
//!   │        └── fast path (sweep disabled) ──► DelayQueue
//!   ├── Dispatcher: every N s, find_due(now + look-ahead) ──► DelayQueue
//!   └── DelayQueue workers ──► JobRunner
//!                                ├── claim (is_running 0 → 1)
//!                                ├── TaskRegistry::create(task_name).run(job)
//!                                └── recurring → next slot | continuation → now + δ | delete
//! ```

pub mod delay;
pub mod dispatch;
pub mod engine;
pub mod job;
pub mod persistence;
pub mod recurrence;
pub mod runner;
pub mod tasks;

pub use delay::DelayQueue;
pub use engine::JobScheduler;
pub use job::{Job, JobId};
pub use persistence::{JobStore, SqliteJobStore};
pub use runner::{JobRunner, RunOutcome};
pub use tasks::{Task, TaskFactory, TaskRegistry};
