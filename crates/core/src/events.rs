use crate::error::TaskError;
use crate::types::{JobId, TaskFailure, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A job or task transition, as recorded in the event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(job_id: JobId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Job lifecycle
    JobCreated {
        workflow_id: WorkflowId,
        workflow_version: u32,
    },
    JobStarted,
    JobSucceeded {
        duration_ms: u64,
    },
    JobFailed {
        failures: Vec<TaskFailure>,
    },
    JobStopped {
        reason: String,
    },
    JobCancelled {
        reason: String,
    },

    // Task lifecycle
    TaskQueued {
        task_id: TaskId,
        attempt: u32,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
        attempt: u32,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: TaskError,
        will_retry: bool,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::JobCreated { .. } => "job_created",
            EventType::JobStarted => "job_started",
            EventType::JobSucceeded { .. } => "job_succeeded",
            EventType::JobFailed { .. } => "job_failed",
            EventType::JobStopped { .. } => "job_stopped",
            EventType::JobCancelled { .. } => "job_cancelled",
            EventType::TaskQueued { .. } => "task_queued",
            EventType::TaskStarted { .. } => "task_started",
            EventType::TaskSucceeded { .. } => "task_succeeded",
            EventType::TaskFailed { .. } => "task_failed",
            EventType::TaskSkipped { .. } => "task_skipped",
        }
    }
}

/// Append-only sink for job events
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// All events of a job, oldest first
    async fn get_job_events(&self, job_id: JobId) -> anyhow::Result<Vec<Event>>;

    /// Persist anything still buffered
    async fn flush_all(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Event log kept in memory; used when no event directory is configured
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<JobId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .entry(event.job_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_job_events(&self, job_id: JobId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}
