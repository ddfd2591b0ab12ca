use crate::types::{JobId, JobState, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type returned by the orchestrator facade.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Structural defects in a workflow definition. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow defines no tasks")]
    EmptyWorkflow,

    #[error("task id {0} is defined more than once")]
    DuplicateTaskId(TaskId),

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("workflow contains a dependency cycle involving {}", join_ids(.0))]
    CyclicDependency(Vec<TaskId>),
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a single task attempt did not produce an outcome.
///
/// Stored on the task run, so it is part of every job snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("task timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("task execution failed: {message}")]
    ExecutionFailure { message: String },

    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::ExecutionFailure {
            message: message.into(),
        }
    }

    /// Label used for metrics and events
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Timeout { .. } => "timeout",
            TaskError::ExecutionFailure { .. } => "execution_failure",
            TaskError::Cancelled => "cancelled",
        }
    }

    /// Cancellation never consumes a retry.
    pub fn counts_against_retries(&self) -> bool {
        !matches!(self, TaskError::Cancelled)
    }
}

/// An operation that is illegal for the job's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot {operation} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        operation: &'static str,
    },
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    InvalidState(#[from] StateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn workflow_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "workflow",
            id: id.to_string(),
        }
    }

    pub fn job_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "job",
            id: id.to_string(),
        }
    }

    /// Label used for metrics and API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Validation(_) => "validation",
            EngineError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_tasks() {
        let err = ValidationError::CyclicDependency(vec![TaskId::new("a"), TaskId::new("b")]);
        assert_eq!(
            err.to_string(),
            "workflow contains a dependency cycle involving a, b"
        );
    }

    #[test]
    fn test_task_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(TaskError::Timeout { after_ms: 1500 }).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["after_ms"], 1500);

        let back: TaskError = serde_json::from_value(json).unwrap();
        assert_eq!(back, TaskError::Timeout { after_ms: 1500 });
    }

    #[test]
    fn test_cancellation_does_not_consume_retries() {
        assert!(!TaskError::Cancelled.counts_against_retries());
        assert!(TaskError::failure("boom").counts_against_retries());
    }
}
