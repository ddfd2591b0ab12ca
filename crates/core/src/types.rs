use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a stored workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a job (one execution of a workflow)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// State of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a task within one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// A dependency in this state can never let its dependents run.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative workflow as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<TaskSpec>,
}

/// Specification for a single task in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub name: Option<String>,
    pub action: TaskAction,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Number of retries after the first attempt
    #[serde(default)]
    pub retry_limit: u32,
    /// Per-attempt timeout; the engine default applies when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: TaskId::new(id),
            name: None,
            action,
            depends_on: Vec::new(),
            retry_limit: 0,
            timeout_secs: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId::new(*d)).collect();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}

/// Opaque work performed by a task, selected by its `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    /// Run a subprocess
    Script {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Call an arbitrary HTTP endpoint
    Http {
        #[serde(default = "default_http_method")]
        method: String,
        url: String,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Call a named downstream service (e.g. `ml`, `ocr`)
    Service {
        service: String,
        path: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    /// Succeed immediately with the given result
    Noop {
        #[serde(default)]
        result: serde_json::Value,
    },
}

fn default_http_method() -> String {
    "GET".to_string()
}

impl TaskAction {
    /// Tag used to pick the executor for this action
    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::Script { .. } => "script",
            TaskAction::Http { .. } => "http",
            TaskAction::Service { .. } => "service",
            TaskAction::Noop { .. } => "noop",
        }
    }
}

/// A validated, stored workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub version: u32,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            name: self.definition.name.clone(),
            version: self.version,
            task_count: self.definition.tasks.len(),
            updated_at: self.updated_at,
        }
    }
}

/// One execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// One run per task, in workflow definition order
    pub tasks: Vec<TaskRun>,
    /// Tasks that ended `failed`, with their final error
    #[serde(default)]
    pub failures: Vec<TaskFailure>,
}

impl Job {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRun> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks
            .iter()
            .find(|t| t.task_id.0 == task_id)
            .map(|t| t.state)
    }

    /// Percentage of task runs that reached a terminal state
    pub fn progress(&self) -> u8 {
        if self.tasks.is_empty() {
            return 100;
        }
        let done = self.tasks.iter().filter(|t| t.state.is_terminal()).count();
        ((done * 100) / self.tasks.len()) as u8
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            workflow_id: self.workflow_id,
            state: self.state,
            progress: self.progress(),
            created_at: self.created_at,
        }
    }
}

/// Execution record of one task within one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Attempts started so far
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
    pub result: Option<serde_json::Value>,
}

impl TaskRun {
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }
}

/// Cause attached to a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error: TaskError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub task_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub state: JobState,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing workflows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    /// Case-insensitive substring of the workflow name
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl WorkflowFilter {
    pub fn matches(&self, workflow: &Workflow) -> bool {
        match &self.name_contains {
            Some(needle) => workflow
                .definition
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| s == job.state)
            && self.workflow_id.map_or(true, |w| w == job.workflow_id)
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    10
}

pub const MAX_PAGE_LIMIT: u32 = 100;

impl Default for Page {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Slice an already filtered and ordered list
    pub fn apply<T>(self, items: Vec<T>) -> Paginated<T> {
        let page = self.page.max(1);
        let limit = self.limit.clamp(1, MAX_PAGE_LIMIT);
        let total = items.len();
        let offset = ((page - 1) as usize).saturating_mul(limit as usize);

        let items = items
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect();

        Paginated {
            items,
            total,
            page,
            limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_action_tagging() {
        let action: TaskAction = serde_json::from_value(serde_json::json!({
            "type": "http",
            "url": "http://localhost/ping",
        }))
        .unwrap();

        assert_eq!(action.kind(), "http");
        match action {
            TaskAction::Http { method, body, .. } => {
                assert_eq!(method, "GET");
                assert!(body.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_task_spec_defaults() {
        let spec: TaskSpec = serde_json::from_value(serde_json::json!({
            "id": "extract",
            "action": { "type": "noop" },
        }))
        .unwrap();

        assert_eq!(spec.retry_limit, 0);
        assert!(spec.depends_on.is_empty());
        assert!(spec.timeout_secs.is_none());
    }

    #[test]
    fn test_page_clamps_and_slices() {
        let items: Vec<u32> = (0..25).collect();

        let page = Page::new(3, 10).apply(items.clone());
        assert_eq!(page.items, vec![20, 21, 22, 23, 24]);
        assert_eq!(page.total, 25);

        let page = Page::new(0, 0).apply(items.clone());
        assert_eq!(page.page, 1);
        assert_eq!(page.items, vec![0]);

        let page = Page::new(9, 10).apply(items);
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Stopped.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(TaskState::Failed.blocks_dependents());
        assert!(!TaskState::Succeeded.blocks_dependents());
    }
}
