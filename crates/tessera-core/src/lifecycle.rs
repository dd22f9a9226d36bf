//! Execution state machine for workflows and steps.
//!
//! Step: `pending -> running -> completed | failed | retrying | cancelled`,
//! `retrying -> running | cancelled`, `pending -> cancelled`.
//! Workflow: `pending -> running -> completed | failed | cancelled`,
//! `pending -> cancelled`.
//!
//! Every transition recomputes [`WorkflowMetadata`](crate::WorkflowMetadata)
//! before returning, so the counters never disagree with the steps.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::types::ExecutionStatus;
use crate::workflow::{FailurePolicy, StepId, WorkflowExecution};

/// What a reported step failure turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// The step is queued for another attempt.
    Retrying { retry_count: u32 },
    /// The step exhausted its budget and is permanently failed.
    Exhausted,
}

impl WorkflowExecution {
    fn ensure_not_terminal(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TesseraError::WorkflowTerminal {
                workflow_id: self.id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn step_transition_error(&self, index: usize, to: ExecutionStatus) -> TesseraError {
        TesseraError::InvalidTransition {
            subject: format!("step {}", self.steps[index].id),
            from: self.steps[index].status,
            to,
        }
    }

    /// Move a pending workflow to running.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_not_terminal()?;
        if self.status != ExecutionStatus::Pending {
            return Err(TesseraError::InvalidTransition {
                subject: format!("workflow {}", self.id),
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }

        self.status = ExecutionStatus::Running;
        self.start_time = Utc::now();
        self.refresh_metadata();
        Ok(())
    }

    /// Dispatch a step. Its producers must all be completed.
    pub fn start_step(&mut self, id: &StepId) -> Result<()> {
        self.ensure_not_terminal()?;
        let index = self.step_index(id)?;

        if self.status != ExecutionStatus::Running {
            return Err(TesseraError::InvalidTransition {
                subject: format!("workflow {}", self.id),
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }

        if !matches!(
            self.steps[index].status,
            ExecutionStatus::Pending | ExecutionStatus::Retrying
        ) {
            return Err(self.step_transition_error(index, ExecutionStatus::Running));
        }

        if let Some(pending) = self
            .dependencies_of(id)
            .iter()
            .find(|producer| {
                self.step(producer)
                    .map_or(true, |s| s.status != ExecutionStatus::Completed)
            })
        {
            return Err(TesseraError::DependencyNotMet {
                step_id: id.to_string(),
                pending_dependency: pending.to_string(),
            });
        }

        let step = &mut self.steps[index];
        step.status = ExecutionStatus::Running;
        step.start_time = Some(Utc::now());
        step.end_time = None;
        self.in_flight.insert(id.clone());
        Ok(())
    }

    /// Record a successful attempt. Completes the workflow once every step is done.
    pub fn complete_step(&mut self, id: &StepId, output: serde_json::Value) -> Result<()> {
        self.ensure_not_terminal()?;
        let index = self.step_index(id)?;
        if self.steps[index].status != ExecutionStatus::Running {
            return Err(self.step_transition_error(index, ExecutionStatus::Completed));
        }

        let step = &mut self.steps[index];
        step.status = ExecutionStatus::Completed;
        step.output = Some(output);
        step.error = None;
        step.end_time = Some(Utc::now());
        self.in_flight.remove(id);

        self.refresh_metadata();
        self.settle();
        Ok(())
    }

    /// Record a failed attempt. Retries while the step has budget left,
    /// otherwise fails it and applies the workflow's [`FailurePolicy`].
    pub fn fail_step(&mut self, id: &StepId, error: impl Into<String>) -> Result<FailureOutcome> {
        self.ensure_not_terminal()?;
        let index = self.step_index(id)?;
        if self.steps[index].status != ExecutionStatus::Running {
            return Err(self.step_transition_error(index, ExecutionStatus::Failed));
        }

        if self.steps[index].has_retry_budget() {
            let step = &mut self.steps[index];
            step.status = ExecutionStatus::Retrying;
            step.retry_count += 1;
            step.error = Some(error.into());
            step.end_time = Some(Utc::now());
            let retry_count = step.retry_count;
            self.in_flight.remove(id);
            self.refresh_metadata();
            return Ok(FailureOutcome::Retrying { retry_count });
        }

        self.exhaust(index, error.into());
        Ok(FailureOutcome::Exhausted)
    }

    /// Fail a running step without spending its retry budget, for failures
    /// a retry cannot fix.
    pub fn abort_step(&mut self, id: &StepId, error: impl Into<String>) -> Result<()> {
        self.ensure_not_terminal()?;
        let index = self.step_index(id)?;
        if self.steps[index].status != ExecutionStatus::Running {
            return Err(self.step_transition_error(index, ExecutionStatus::Failed));
        }

        self.exhaust(index, error.into());
        Ok(())
    }

    /// Cancel the workflow and every step that has not finished.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_not_terminal()?;

        let now = Utc::now();
        for step in self.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = ExecutionStatus::Cancelled;
            step.end_time = Some(now);
        }
        self.in_flight.clear();

        self.finish(ExecutionStatus::Cancelled, Some(reason.into()));
        Ok(())
    }

    /// Fail the whole workflow for a reason outside any single step, such as
    /// a store error. Unfinished steps are cancelled.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_not_terminal()?;

        let now = Utc::now();
        for step in self.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = ExecutionStatus::Cancelled;
            step.end_time = Some(now);
        }
        self.in_flight.clear();

        self.finish(ExecutionStatus::Failed, Some(error.into()));
        Ok(())
    }

    /// Recompute progress counters from the steps.
    pub fn refresh_metadata(&mut self) {
        let total = self.steps.len();
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .count();
        let failed = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Failed)
            .count();

        self.metadata.total_steps = total;
        self.metadata.completed_steps = completed;
        self.metadata.failed_steps = failed;
        self.metadata.progress = if total == 0 {
            0
        } else {
            ((completed as f64 * 100.0) / total as f64).round() as u8
        };
        self.metadata.estimated_completion = self.estimate_completion();
    }

    /// Average completed-step duration times the steps still outstanding.
    fn estimate_completion(&self) -> Option<chrono::DateTime<Utc>> {
        if self.status != ExecutionStatus::Running {
            return None;
        }

        let durations: Vec<u64> = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .filter_map(|s| s.duration_ms())
            .collect();
        if durations.is_empty() {
            return None;
        }

        let average = durations.iter().sum::<u64>() / durations.len() as u64;
        let remaining = self
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count() as u64;
        Some(Utc::now() + Duration::milliseconds((average * remaining) as i64))
    }

    fn exhaust(&mut self, index: usize, error: String) {
        let id = self.steps[index].id.clone();
        let now = Utc::now();

        let step = &mut self.steps[index];
        step.status = ExecutionStatus::Failed;
        step.error = Some(error.clone());
        step.end_time = Some(now);
        self.in_flight.remove(&id);

        match self.failure_policy {
            FailurePolicy::FailFast => {
                for step in self.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
                    step.status = ExecutionStatus::Cancelled;
                    step.end_time = Some(now);
                }
                self.in_flight.clear();
                self.finish(
                    ExecutionStatus::Failed,
                    Some(format!("Step {} failed: {}", id, error)),
                );
            }
            FailurePolicy::BestEffort => {
                let dependents = self.dependents_of(&id);
                for step in self
                    .steps
                    .iter_mut()
                    .filter(|s| dependents.contains(&s.id) && !s.status.is_terminal())
                {
                    step.status = ExecutionStatus::Cancelled;
                    step.end_time = Some(now);
                }
                for dependent in &dependents {
                    self.in_flight.remove(dependent);
                }
                self.refresh_metadata();
                self.settle();
            }
        }
    }

    /// Close the workflow once no step can make further progress.
    fn settle(&mut self) {
        if self.status.is_terminal() || self.steps.iter().any(|s| !s.status.is_terminal()) {
            return;
        }

        let failed: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Failed)
            .map(|s| s.id.to_string())
            .collect();

        if self
            .steps
            .iter()
            .all(|s| s.status == ExecutionStatus::Completed)
        {
            self.finish(ExecutionStatus::Completed, None);
        } else {
            self.finish(
                ExecutionStatus::Failed,
                Some(format!("Steps failed: {}", failed.join(", "))),
            );
        }
    }

    fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.end_time = Some(now);
        self.total_duration_ms = Some((now - self.start_time).num_milliseconds().max(0) as u64);
        self.refresh_metadata();
    }
}
