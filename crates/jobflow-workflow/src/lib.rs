//! # Jobflow Workflow
//!
//! Step-based state machine for long-running processes.
//!
//! ## Design Principles
//! - An instance is a row: current step, status, context and variables
//! - Steps are stateless; everything they need lives on the instance
//! - Waiting never blocks a thread — a suspended step leaves one resume job behind
//! - The transition table is the only place that decides what runs next
//!
//! ## Architecture
//! ```text
//! WorkflowEngine
//!   ├── schedule_workflow ──► WorkflowStore + workflow_task job
//!   ├── workflow_task (fired by the scheduler) ──► execute_current_step
//!   │      ├── step.execute (timeout, panic guard)
//!   │      ├── Some(event) ──► transition table ──► next step | terminal status
//!   │      ├── None        ──► suspended until the step's resume job fires
//!   │      └── Err         ──► retry with backoff | failure event | FAILED
//!   └── operator actions: process_event · retry · cancel · delete
//! ```

pub mod definition;
pub mod engine;
pub mod model;
pub mod persistence;
pub mod step;
pub mod task;

pub use definition::{TerminalStatus, Transition, WorkflowBuilder, WorkflowDefinition};
pub use engine::{LAST_ERROR_VAR, WorkflowEngine};
pub use model::{EventType, WorkflowEvent, WorkflowInstance, WorkflowStats, WorkflowStatus};
pub use persistence::{SqliteWorkflowStore, WorkflowStore};
pub use step::{StepContext, StepKind, StepMeta, WorkflowStep};
pub use task::{WORKFLOW_TASK, WorkflowTask, task_payload};
