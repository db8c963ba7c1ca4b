//! Step Orchestrator
//!
//! Runs an ordered list of named steps against one [`RunContext`], numbering
//! them from 1 and reporting each before it starts and after it finishes.
//! The first failing step aborts the run: no later step executes.
//!
//! # Step States
//!
//! ```text
//! Pending -> Running -> Completed
//!                   \-> Aborted
//! ```
//!
//! Transitions are forward-only and validated; terminal states are final.

use crate::error::{ProvisionError, Result};
use crate::runner::CommandRunner;
use crossterm::style::Stylize;
use std::time::{Duration, Instant};
use strum::Display;
use thiserror::Error;

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl StepState {
    /// Returns true for Completed and Aborted
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Returns true if `next` is a legal successor of this state
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Aborted)
        )
    }
}

/// Everything a run owns: the command runner and with it the session.
/// Nothing about a run lives in globals.
#[derive(Debug)]
pub struct RunContext {
    runner: CommandRunner,
}

impl RunContext {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    #[inline]
    pub fn runner(&mut self) -> &mut CommandRunner {
        &mut self.runner
    }

    /// Close the session. Also happens on drop.
    pub fn close(&mut self) -> Result<()> {
        self.runner.close()
    }
}

/// The work a step performs
pub type StepAction = Box<dyn FnOnce(&mut RunContext) -> Result<()>>;

/// A numbered, described unit of work. Built once by the plan, never edited.
pub struct Step {
    index: usize,
    description: String,
    state: StepState,
    action: Option<StepAction>,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("index", &self.index)
            .field("description", &self.description)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Step {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    fn failure(&self, source: ProvisionError) -> StepFailure {
        StepFailure {
            index: self.index,
            description: self.description.clone(),
            source,
        }
    }

    fn transition(&mut self, next: StepState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProvisionError::step_transition(format!(
                "step {} ({}) cannot go from {} to {}",
                self.index, self.description, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Receives step lifecycle events.
pub trait Reporter {
    fn step_started(&mut self, index: usize, description: &str);
    fn step_completed(&mut self, index: usize, description: &str, elapsed: Duration);
    fn step_failed(&mut self, index: usize, description: &str, error: &ProvisionError);
    /// Free-form message outside any step
    fn note(&mut self, text: &str);
}

/// Prints `N. [description]` headers to stdout.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn step_started(&mut self, index: usize, description: &str) {
        println!("{}", format!("{}. [{}]", index, description).green());
    }

    fn step_completed(&mut self, _index: usize, _description: &str, elapsed: Duration) {
        println!("   {} ({:.1}s)", "done".green(), elapsed.as_secs_f64());
    }

    fn step_failed(&mut self, index: usize, description: &str, error: &ProvisionError) {
        println!(
            "{}",
            format!("Step {} [{}] failed: {}", index, description, error).red()
        );
    }

    fn note(&mut self, text: &str) {
        println!("{}", text.green());
    }
}

/// A reporter event, as recorded by [`RecordingReporter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Started { index: usize, description: String },
    Completed { index: usize, description: String },
    Failed {
        index: usize,
        description: String,
        error: String,
    },
    Note(String),
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<ReportEvent>,
}

impl RecordingReporter {
    /// Indexes of steps that were started, in order
    pub fn started(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Started { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn step_started(&mut self, index: usize, description: &str) {
        self.events.push(ReportEvent::Started {
            index,
            description: description.to_string(),
        });
    }

    fn step_completed(&mut self, index: usize, description: &str, _elapsed: Duration) {
        self.events.push(ReportEvent::Completed {
            index,
            description: description.to_string(),
        });
    }

    fn step_failed(&mut self, index: usize, description: &str, error: &ProvisionError) {
        self.events.push(ReportEvent::Failed {
            index,
            description: description.to_string(),
            error: error.to_string(),
        });
    }

    fn note(&mut self, text: &str) {
        self.events.push(ReportEvent::Note(text.to_string()));
    }
}

/// A completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub index: usize,
    pub description: String,
    pub elapsed: Duration,
}

/// Summary of a run where every step completed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: Vec<StepRecord>,
}

/// The step that aborted a run and why
#[derive(Error, Debug)]
#[error("step {index} ({description}) failed: {source}")]
pub struct StepFailure {
    pub index: usize,
    pub description: String,
    #[source]
    pub source: ProvisionError,
}

/// An ordered list of steps.
#[derive(Debug, Default)]
pub struct Orchestrator {
    steps: Vec<Step>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; it gets the next 1-based index.
    pub fn add_step<F>(&mut self, description: impl Into<String>, action: F) -> &mut Self
    where
        F: FnOnce(&mut RunContext) -> Result<()> + 'static,
    {
        self.steps.push(Step {
            index: self.steps.len() + 1,
            description: description.into(),
            state: StepState::Pending,
            action: Some(Box::new(action)),
        });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure.
    pub fn run(
        mut self,
        ctx: &mut RunContext,
        reporter: &mut dyn Reporter,
    ) -> std::result::Result<RunReport, StepFailure> {
        let mut report = RunReport::default();

        for step in &mut self.steps {
            let index = step.index;
            reporter.step_started(index, &step.description);
            tracing::debug!("Starting step {}: {}", index, step.description);
            step.transition(StepState::Running)
                .map_err(|e| step.failure(e))?;

            let started = Instant::now();
            let result = match step.action.take() {
                Some(action) => action(ctx),
                None => Err(ProvisionError::step_transition(format!(
                    "step {} has already run",
                    index
                ))),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    step.transition(StepState::Completed)
                        .map_err(|e| step.failure(e))?;
                    reporter.step_completed(index, &step.description, elapsed);
                    report.completed.push(StepRecord {
                        index,
                        description: step.description.clone(),
                        elapsed,
                    });
                }
                Err(e) => {
                    tracing::error!("Step {} ({}) failed: {}", index, step.description, e);
                    reporter.step_failed(index, &step.description, &e);
                    if let Err(transition) = step.transition(StepState::Aborted) {
                        tracing::warn!("{}", transition);
                    }
                    return Err(step.failure(e));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(StepState::Pending.can_transition_to(StepState::Running));
        assert!(StepState::Running.can_transition_to(StepState::Completed));
        assert!(StepState::Running.can_transition_to(StepState::Aborted));

        assert!(!StepState::Pending.can_transition_to(StepState::Completed));
        assert!(!StepState::Completed.can_transition_to(StepState::Running));
        assert!(!StepState::Aborted.can_transition_to(StepState::Running));
        assert!(!StepState::Running.can_transition_to(StepState::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepState::Completed.is_terminal());
        assert!(StepState::Aborted.is_terminal());
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }

    #[test]
    fn test_add_step_numbers_from_one() {
        let mut plan = Orchestrator::new();
        plan.add_step("first", |_| Ok(()))
            .add_step("second", |_| Ok(()));
        let indexes: Vec<usize> = plan.steps().iter().map(Step::index).collect();
        assert_eq!(indexes, vec![1, 2]);
        assert!(plan.steps().iter().all(|s| s.state() == StepState::Pending));
    }

    #[test]
    fn test_failure_display() {
        let failure = StepFailure {
            index: 3,
            description: "Installing docker".to_string(),
            source: ProvisionError::channel("broken pipe"),
        };
        assert_eq!(
            failure.to_string(),
            "step 3 (Installing docker) failed: Channel error: broken pipe"
        );
    }
}
