//! Workflow definitions: registered steps plus the transition table.
//! Definitions are validated once, when built, so a running engine never
//! meets a dangling step name it could have caught at startup.

use std::collections::HashMap;
use std::sync::Arc;

use jobflow_core::{JobflowError, Result};

use crate::model::{EventType, WorkflowStatus};
use crate::step::WorkflowStep;

/// Final status applied when a terminal transition is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for WorkflowStatus {
    fn from(t: TerminalStatus) -> Self {
        match t {
            TerminalStatus::Completed => WorkflowStatus::Completed,
            TerminalStatus::Failed => WorkflowStatus::Failed,
        }
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub event: EventType,
    pub to: String,
    /// Set when `to` is a marker that ends the instance.
    pub terminal: Option<TerminalStatus>,
}

/// A named workflow: start step, step registry and transition table.
pub struct WorkflowDefinition {
    name: String,
    initial_step: String,
    steps: HashMap<String, Arc<dyn WorkflowStep>>,
    transitions: HashMap<(String, EventType), Transition>,
    failure_marker: Option<String>,
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("initial_step", &self.initial_step)
            .field("steps", &self.step_names())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl WorkflowDefinition {
    pub fn builder(name: &str) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.to_string(),
            initial_step: None,
            steps: Vec::new(),
            transitions: Vec::new(),
            failure_marker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    pub fn step(&self, name: &str) -> Option<&Arc<dyn WorkflowStep>> {
        self.steps.get(name)
    }

    pub fn transition(&self, from: &str, event: &EventType) -> Option<&Transition> {
        self.transitions.get(&(from.to_string(), event.clone()))
    }

    /// Step names, sorted.
    pub fn step_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All transitions, ordered by source step then event.
    pub fn transitions(&self) -> Vec<&Transition> {
        let mut all: Vec<&Transition> = self.transitions.values().collect();
        all.sort_by(|a, b| (&a.from, &a.event).cmp(&(&b.from, &b.event)));
        all
    }

    /// A COMPLETED instance resting on this step actually failed and may be
    /// reopened with an event.
    pub fn is_failure_marker(&self, step: &str) -> bool {
        self.failure_marker.as_deref() == Some(step)
    }
}

/// Builder for [`WorkflowDefinition`].
pub struct WorkflowBuilder {
    name: String,
    initial_step: Option<String>,
    steps: Vec<Arc<dyn WorkflowStep>>,
    transitions: Vec<Transition>,
    failure_marker: Option<String>,
}

impl WorkflowBuilder {
    pub fn initial_step(mut self, step: &str) -> Self {
        self.initial_step = Some(step.to_string());
        self
    }

    pub fn step(mut self, step: impl WorkflowStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn WorkflowStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// `from` --event--> `to`, where `to` is another registered step.
    pub fn transition(self, from: &str, event: impl Into<EventType>, to: &str) -> Self {
        self.push(from, event.into(), to, None)
    }

    /// `from` --event--> `to`, ending the instance as COMPLETED.
    pub fn complete_on(self, from: &str, event: impl Into<EventType>, to: &str) -> Self {
        self.push(from, event.into(), to, Some(TerminalStatus::Completed))
    }

    /// `from` --event--> `to`, ending the instance as FAILED.
    pub fn fail_on(self, from: &str, event: impl Into<EventType>, to: &str) -> Self {
        self.push(from, event.into(), to, Some(TerminalStatus::Failed))
    }

    pub fn failure_marker(mut self, step: &str) -> Self {
        self.failure_marker = Some(step.to_string());
        self
    }

    fn push(mut self, from: &str, event: EventType, to: &str, terminal: Option<TerminalStatus>) -> Self {
        self.transitions.push(Transition {
            from: from.to_string(),
            event,
            to: to.to_string(),
            terminal,
        });
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition> {
        let name = self.name;
        let invalid = |msg: String| JobflowError::Config(format!("workflow '{name}': {msg}"));

        if name.trim().is_empty() {
            return Err(JobflowError::Config("workflow name must not be empty".into()));
        }

        let mut steps: HashMap<String, Arc<dyn WorkflowStep>> = HashMap::new();
        for step in self.steps {
            let step_name = step.name().to_string();
            if step_name.trim().is_empty() {
                return Err(invalid("step with empty name".into()));
            }
            if steps.insert(step_name.clone(), step).is_some() {
                return Err(invalid(format!("step '{step_name}' registered twice")));
            }
        }

        let initial_step = self
            .initial_step
            .ok_or_else(|| invalid("no initial step".into()))?;
        if !steps.contains_key(&initial_step) {
            return Err(invalid(format!("initial step '{initial_step}' is not registered")));
        }

        let mut transitions = HashMap::new();
        for t in self.transitions {
            if !steps.contains_key(&t.from) {
                return Err(invalid(format!("transition source '{}' is not registered", t.from)));
            }
            if t.terminal.is_none() && !steps.contains_key(&t.to) {
                return Err(invalid(format!(
                    "transition {} --{}--> {} targets an unregistered step",
                    t.from, t.event, t.to
                )));
            }
            let key = (t.from.clone(), t.event.clone());
            if transitions.contains_key(&key) {
                return Err(invalid(format!(
                    "duplicate transition from '{}' on '{}'",
                    t.from, t.event
                )));
            }
            transitions.insert(key, t);
        }

        Ok(WorkflowDefinition {
            name,
            initial_step,
            steps,
            transitions,
            failure_marker: self.failure_marker,
        })
    }
}
