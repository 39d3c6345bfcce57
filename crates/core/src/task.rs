//! Measurement task lifecycle record.
//!
//! States only move forward:
//!
//! ```text
//! queued -> running -> completed
//!    |         |
//!    +---------+-----> failed
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorType};
use crate::metrics::AggregatedEnergyMetrics;
use crate::types::{TaskId, Timestamp};
use crate::validation::ValidationOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Measurement progress, reported while `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validating,
    AcquiringLock,
    Warmup,
    Measuring,
    Aggregating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub phase: Phase,
    /// 1-based index of the trial in progress within the phase.
    pub current: u32,
    pub total: u32,
}

/// How a task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed {
        validation: ValidationOutcome,
        metrics: AggregatedEnergyMetrics,
    },
    Failed {
        error_type: ErrorType,
        message: String,
        validation: Option<ValidationOutcome>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementTask {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_metrics: Option<AggregatedEnergyMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_name: Option<String>,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl MeasurementTask {
    pub fn queued(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Queued,
            progress: None,
            validation: None,
            energy_metrics: None,
            error_type: None,
            error_message: None,
            candidate_id: None,
            problem_name: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_labels(
        mut self,
        candidate_id: Option<String>,
        problem_name: Option<String>,
    ) -> Self {
        self.candidate_id = candidate_id;
        self.problem_name = problem_name;
        self
    }

    fn check_transition(&self, next: TaskState) -> Result<(), CoreError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "Task {} cannot move from {} to {}",
                self.task_id,
                self.state.as_str(),
                next.as_str()
            )))
        }
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        self.check_transition(TaskState::Running)?;
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Update progress. Only meaningful while running.
    pub fn set_progress(&mut self, progress: TaskProgress) -> Result<(), CoreError> {
        if self.state != TaskState::Running {
            return Err(CoreError::Conflict(format!(
                "Task {} is {}, not running",
                self.task_id,
                self.state.as_str()
            )));
        }
        self.progress = Some(progress);
        Ok(())
    }

    /// Move to a terminal state.
    ///
    /// Energy metrics are only attached to a completed task whose validation
    /// passed; any other combination is rejected.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<(), CoreError> {
        match outcome {
            TaskOutcome::Completed {
                validation,
                metrics,
            } => {
                self.check_transition(TaskState::Completed)?;
                if !validation.is_correct {
                    return Err(CoreError::Validation(
                        "cannot complete a task whose validation failed".to_string(),
                    ));
                }
                self.state = TaskState::Completed;
                self.validation = Some(validation);
                self.energy_metrics = Some(metrics);
            }
            TaskOutcome::Failed {
                error_type,
                message,
                validation,
            } => {
                self.check_transition(TaskState::Failed)?;
                self.state = TaskState::Failed;
                self.validation = validation;
                self.energy_metrics = None;
                self.error_type = Some(error_type);
                self.error_message = Some(message);
            }
        }
        self.progress = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
