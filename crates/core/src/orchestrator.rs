use crate::error::{EngineError, Result, StateError};
use crate::events::{Event, EventLog, EventType};
use crate::metrics::MetricsSnapshot;
use crate::storage::JobStore;
use crate::types::{
    Job, JobFilter, JobId, JobState, JobSummary, Page, Paginated, Workflow, WorkflowDefinition,
    WorkflowFilter, WorkflowId, WorkflowSummary,
};
use crate::workflow::{close_interrupted, create_job, EngineContext, JobHandle, ValidatedWorkflow};
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

/// Entry point of the engine: owns the workflow catalog and every job handle.
///
/// Operations on one job are serialized by that job's controller; the
/// maps here are only locked long enough to look a handle up.
pub struct Orchestrator {
    ctx: EngineContext,
    workflows: RwLock<HashMap<WorkflowId, Arc<ValidatedWorkflow>>>,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
}

impl Orchestrator {
    /// Load persisted workflows and jobs and resume where possible.
    ///
    /// Jobs still `created` get a fresh controller if their workflow version
    /// is still current. Other unfinished jobs, including those that were
    /// running when the engine went down, are closed as `stopped`.
    pub async fn open(ctx: EngineContext) -> anyhow::Result<Self> {
        let mut workflows = HashMap::new();
        for workflow in ctx.store.list_workflows().context("Failed to load workflows")? {
            let id = workflow.id;
            match ValidatedWorkflow::new(workflow) {
                Ok(validated) => {
                    workflows.insert(id, Arc::new(validated));
                }
                Err(e) => tracing::warn!(workflow_id = %id, "Ignoring stored workflow: {}", e),
            }
        }

        let mut jobs = HashMap::new();
        let mut resumed = 0;
        let mut interrupted = 0;

        for mut job in ctx.store.list_jobs().context("Failed to load jobs")? {
            let workflow = workflows.get(&job.workflow_id).cloned();

            let handle = match (job.state, workflow) {
                (JobState::Created, Some(workflow)) if workflow.version() == job.workflow_version => {
                    resumed += 1;
                    JobHandle::spawn(ctx.clone(), workflow, job)
                }
                (state, _) if !state.is_terminal() => {
                    interrupted += 1;
                    let events = close_interrupted(&mut job, "engine restarted");
                    ctx.store
                        .put_job(&job)
                        .with_context(|| format!("Failed to close interrupted job {}", job.id))?;
                    for event_type in events {
                        if let Err(e) = ctx.event_log.append(Event::new(job.id, event_type)).await {
                            tracing::warn!(job_id = %job.id, "Failed to append event: {:#}", e);
                        }
                    }
                    JobHandle::finished(job)
                }
                _ => JobHandle::finished(job),
            };

            let id = handle.snapshot().id;
            jobs.insert(id, handle);
        }

        tracing::info!(
            "Loaded {} workflows and {} jobs ({} resumed, {} closed as stopped)",
            workflows.len(),
            jobs.len(),
            resumed,
            interrupted
        );

        Ok(Self {
            ctx,
            workflows: RwLock::new(workflows),
            jobs: RwLock::new(jobs),
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    // Workflows

    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<Workflow> {
        let now = Utc::now();
        let validated = ValidatedWorkflow::new(Workflow {
            id: WorkflowId::new(),
            version: 1,
            definition,
            created_at: now,
            updated_at: now,
        })?;

        self.ctx
            .store
            .put_workflow(validated.workflow())
            .context("Failed to persist workflow")?;

        let workflow = validated.workflow().clone();
        self.workflows
            .write()
            .await
            .insert(workflow.id, Arc::new(validated));

        tracing::info!(
            workflow_id = %workflow.id,
            tasks = workflow.definition.tasks.len(),
            "Created workflow {}",
            workflow.definition.name
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.workflows
            .read()
            .await
            .get(&id)
            .map(|w| w.workflow().clone())
            .ok_or_else(|| EngineError::workflow_not_found(id))
    }

    pub async fn list_workflows(&self, filter: &WorkflowFilter, page: Page) -> Paginated<WorkflowSummary> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .read()
            .await
            .values()
            .map(|w| w.workflow())
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

        page.apply(workflows.iter().map(Workflow::summary).collect())
    }

    /// Replace a workflow's definition and bump its version.
    ///
    /// Rejected while any job of the workflow is running; jobs keep the
    /// version they were created from.
    pub async fn update_workflow(&self, id: WorkflowId, definition: WorkflowDefinition) -> Result<Workflow> {
        let mut workflows = self.workflows.write().await;
        let current = workflows
            .get(&id)
            .ok_or_else(|| EngineError::workflow_not_found(id))?;

        let running = self.count_jobs(id, |state| state == JobState::Running).await;
        if running > 0 {
            return Err(EngineError::Conflict(format!(
                "workflow {} has {} running job(s)",
                id, running
            )));
        }

        let previous = current.workflow();
        let validated = ValidatedWorkflow::new(Workflow {
            id,
            version: previous.version + 1,
            definition,
            created_at: previous.created_at,
            updated_at: Utc::now(),
        })?;

        self.ctx
            .store
            .put_workflow(validated.workflow())
            .context("Failed to persist workflow")?;

        let workflow = validated.workflow().clone();
        workflows.insert(id, Arc::new(validated));

        tracing::info!(workflow_id = %id, version = workflow.version, "Updated workflow");
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, id: WorkflowId) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if !workflows.contains_key(&id) {
            return Err(EngineError::workflow_not_found(id));
        }

        let live = self.count_jobs(id, |state| !state.is_terminal()).await;
        if live > 0 {
            return Err(EngineError::Conflict(format!(
                "workflow {} is referenced by {} unfinished job(s)",
                id, live
            )));
        }

        self.ctx
            .store
            .delete_workflow(&id)
            .context("Failed to delete workflow")?;
        workflows.remove(&id);

        tracing::info!(workflow_id = %id, "Deleted workflow");
        Ok(())
    }

    async fn count_jobs(&self, workflow_id: WorkflowId, state: impl Fn(JobState) -> bool) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .map(JobHandle::snapshot)
            .filter(|job| job.workflow_id == workflow_id && state(job.state))
            .count()
    }

    // Jobs

    /// New job in `created` state.
    ///
    /// The workflows read guard is held until the handle is registered so a
    /// concurrent delete either sees the job or runs before it exists. Lock
    /// order is always workflows, then jobs.
    pub async fn create_job(&self, workflow_id: WorkflowId) -> Result<Job> {
        let workflows = self.workflows.read().await;
        let workflow = workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::workflow_not_found(workflow_id))?;

        let job = create_job(&workflow);
        self.ctx
            .store
            .put_job(&job)
            .context("Failed to persist job")?;

        let event = Event::new(
            job.id,
            EventType::JobCreated {
                workflow_id,
                workflow_version: workflow.version(),
            },
        );
        if let Err(e) = self.ctx.event_log.append(event).await {
            tracing::warn!(job_id = %job.id, "Failed to append event: {:#}", e);
        }
        self.ctx.metrics.job_transition("none", JobState::Created.as_str());

        let handle = JobHandle::spawn(self.ctx.clone(), workflow, job.clone());
        self.jobs.write().await.insert(job.id, handle);
        drop(workflows);

        tracing::info!(job_id = %job.id, workflow_id = %workflow_id, "Created job");
        Ok(job)
    }

    async fn handle(&self, id: JobId) -> Result<JobHandle> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::job_not_found(id))
    }

    /// Job snapshot including every task run
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        Ok(self.handle(id).await?.snapshot())
    }

    pub async fn list_jobs(&self, filter: &JobFilter, page: Page) -> Paginated<JobSummary> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(JobHandle::snapshot)
            .filter(|job| filter.matches(job))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

        page.apply(jobs.iter().map(Job::summary).collect())
    }

    pub async fn job_events(&self, id: JobId) -> Result<Vec<Event>> {
        self.handle(id).await?;
        Ok(self
            .ctx
            .event_log
            .get_job_events(id)
            .await
            .context("Failed to read job events")?)
    }

    /// Remove a finished job and its snapshot
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let handle = jobs.get(&id).ok_or_else(|| EngineError::job_not_found(id))?;

        let state = handle.state();
        if !state.is_terminal() {
            return Err(StateError::InvalidTransition {
                job_id: id,
                from: state,
                operation: "delete",
            }
            .into());
        }

        self.ctx.store.delete_job(&id).context("Failed to delete job")?;
        jobs.remove(&id);

        tracing::info!(job_id = %id, "Deleted job");
        Ok(())
    }

    /// Start a created job. Serialized with workflow update and delete,
    /// which check running jobs under the workflows write lock.
    pub async fn start_job(&self, id: JobId) -> Result<Job> {
        let _workflows = self.workflows.read().await;
        self.handle(id).await?.start().await
    }

    /// Alias of [`Self::start_job`]
    pub async fn execute_job(&self, id: JobId) -> Result<Job> {
        self.start_job(id).await
    }

    pub async fn stop_job(&self, id: JobId) -> Result<Job> {
        self.handle(id).await?.stop().await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        self.handle(id).await?.cancel().await
    }

    /// Wait for a job to finish; used by callers that execute synchronously
    pub async fn wait_for_job(&self, id: JobId) -> Result<Job> {
        Ok(self.handle(id).await?.wait_until_settled().await)
    }

    /// Stop every live job and flush the event log
    pub async fn shutdown(&self) {
        let live: Vec<JobHandle> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|h| !h.state().is_terminal())
            .cloned()
            .collect();

        tracing::info!("Stopping {} live jobs", live.len());

        let mut stopping = JoinSet::new();
        for handle in live {
            stopping.spawn(async move { handle.stop().await });
        }
        while let Some(result) = stopping.join_next().await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Failed to stop job during shutdown: {}", e),
                Err(e) => tracing::error!("Stop task panicked during shutdown: {}", e),
            }
        }

        if let Err(e) = self.ctx.event_log.flush_all().await {
            tracing::error!("Failed to flush event log: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ValidationError;
    use crate::events::MemoryEventLog;
    use crate::metrics::MetricsCollector;
    use crate::storage::MemoryStore;
    use crate::types::{TaskAction, TaskSpec, TaskState};
    use crate::workflow::ExecutorRegistry;
    use serde_json::Value;

    fn context(store: Arc<MemoryStore>) -> EngineContext {
        EngineContext::new(
            EngineConfig::default(),
            store,
            Arc::new(MemoryEventLog::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(ExecutorRegistry::with_defaults(HashMap::new()).unwrap()),
        )
    }

    async fn orchestrator() -> (Orchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::open(context(store.clone())).await.unwrap();
        (orchestrator, store)
    }

    fn noop(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec::new(id, TaskAction::Noop { result: Value::Null }).depends_on(deps)
    }

    fn definition(name: &str, tasks: Vec<TaskSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: None,
            tasks,
        }
    }

    fn sleeper(id: &str) -> TaskSpec {
        TaskSpec::new(
            id,
            TaskAction::Script {
                command: "sleep".to_string(),
                args: vec!["30".to_string()],
            },
        )
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let (orchestrator, store) = orchestrator().await;

        let created = orchestrator
            .create_workflow(definition("etl", vec![noop("a", &[]), noop("b", &["a"])]))
            .await
            .unwrap();
        assert_eq!(created.version, 1);
        assert!(store.get_workflow(&created.id).unwrap().is_some());

        let updated = orchestrator
            .update_workflow(created.id, definition("etl", vec![noop("a", &[])]))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, created.created_at);

        let fetched = orchestrator.get_workflow(created.id).await.unwrap();
        assert_eq!(fetched.definition.tasks.len(), 1);

        orchestrator.delete_workflow(created.id).await.unwrap();
        assert!(matches!(
            orchestrator.get_workflow(created.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_rejected() {
        let (orchestrator, store) = orchestrator().await;

        let err = orchestrator
            .create_workflow(definition("loop", vec![noop("a", &["b"]), noop("b", &["a"])]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::CyclicDependency(_))
        ));
        assert!(store.list_workflows().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_workflows_filters_and_pages() {
        let (orchestrator, _) = orchestrator().await;
        for name in ["Invoice OCR", "invoice export", "payroll"] {
            orchestrator
                .create_workflow(definition(name, vec![noop("a", &[])]))
                .await
                .unwrap();
        }

        let filter = WorkflowFilter {
            name_contains: Some("INVOICE".to_string()),
        };
        let page = orchestrator.list_workflows(&filter, Page::new(1, 1)).await;
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);

        let all = orchestrator.list_workflows(&WorkflowFilter::default(), Page::default()).await;
        assert_eq!(all.total, 3);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let (orchestrator, _) = orchestrator().await;
        let workflow = orchestrator
            .create_workflow(definition("fan", vec![noop("a", &[]), noop("b", &["a"]), noop("c", &["a"])]))
            .await
            .unwrap();

        let job = orchestrator.create_job(workflow.id).await.unwrap();
        assert_eq!(job.state, JobState::Created);
        assert!(job.tasks.iter().all(|t| t.state == TaskState::Pending));

        orchestrator.execute_job(job.id).await.unwrap();
        let done = orchestrator.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);

        let succeeded = orchestrator
            .list_jobs(
                &JobFilter {
                    state: Some(JobState::Succeeded),
                    workflow_id: None,
                },
                Page::default(),
            )
            .await;
        assert_eq!(succeeded.total, 1);
        assert_eq!(succeeded.items[0].progress, 100);

        let events = orchestrator.job_events(job.id).await.unwrap();
        assert!(matches!(events[0].event_type, EventType::JobCreated { .. }));
        assert!(matches!(
            events.last().unwrap().event_type,
            EventType::JobSucceeded { .. }
        ));

        // Stop on a finished job reports the existing state
        let stopped = orchestrator.stop_job(job.id).await.unwrap();
        assert_eq!(stopped.state, JobState::Succeeded);

        orchestrator.delete_job(job.id).await.unwrap();
        assert!(matches!(
            orchestrator.get_job(job.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found() {
        let (orchestrator, _) = orchestrator().await;

        let err = orchestrator.create_job(WorkflowId::new()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let err = orchestrator.stop_job(JobId::new()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_job_blocks_workflow_changes() {
        let (orchestrator, _) = orchestrator().await;
        let workflow = orchestrator
            .create_workflow(definition("slow", vec![sleeper("wait")]))
            .await
            .unwrap();
        let job = orchestrator.create_job(workflow.id).await.unwrap();

        // A created job only blocks deletion
        assert!(matches!(
            orchestrator.delete_workflow(workflow.id).await,
            Err(EngineError::Conflict(_))
        ));

        orchestrator.start_job(job.id).await.unwrap();

        let err = orchestrator
            .update_workflow(workflow.id, definition("slow", vec![noop("a", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let err = orchestrator.delete_job(job.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let stopped = orchestrator.stop_job(job.id).await.unwrap();
        assert_eq!(stopped.state, JobState::Stopped);

        orchestrator
            .update_workflow(workflow.id, definition("slow", vec![noop("a", &[])]))
            .await
            .unwrap();
        orchestrator.delete_job(job.id).await.unwrap();
        orchestrator.delete_workflow(workflow.id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_workflow_never_orphans_a_new_job() {
        let (orchestrator, _) = orchestrator().await;
        let orchestrator = Arc::new(orchestrator);

        for _ in 0..500 {
            let workflow = orchestrator
                .create_workflow(definition("contended", vec![noop("a", &[])]))
                .await
                .unwrap();

            let creating = tokio::spawn({
                let orchestrator = orchestrator.clone();
                async move { orchestrator.create_job(workflow.id).await }
            });
            let deleting = tokio::spawn({
                let orchestrator = orchestrator.clone();
                async move { orchestrator.delete_workflow(workflow.id).await }
            });

            match (creating.await.unwrap(), deleting.await.unwrap()) {
                (Ok(job), Err(e)) => {
                    assert!(matches!(e, EngineError::Conflict(_)));
                    assert_eq!(orchestrator.get_job(job.id).await.unwrap().state, JobState::Created);
                    orchestrator.get_workflow(workflow.id).await.unwrap();
                }
                (Err(e), Ok(())) => assert_eq!(e.kind(), "not_found"),
                (Ok(job), Ok(())) => panic!("job {} outlived workflow {}", job.id, workflow.id),
                (Err(a), Err(b)) => panic!("both failed: {a}; {b}"),
            }
        }
    }

    #[tokio::test]
    async fn test_open_recovers_persisted_jobs() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let workflow = ValidatedWorkflow::new(Workflow {
            id: WorkflowId::new(),
            version: 1,
            definition: definition("etl", vec![noop("a", &[]), noop("b", &["a"])]),
            created_at: now,
            updated_at: now,
        })
        .unwrap();
        store.put_workflow(workflow.workflow()).unwrap();

        let created = create_job(&workflow);
        store.put_job(&created).unwrap();

        // A job that was mid-flight when the engine went down
        let mut interrupted = create_job(&workflow);
        interrupted.state = JobState::Running;
        interrupted.tasks[0].state = TaskState::Running;
        store.put_job(&interrupted).unwrap();

        let orchestrator = Orchestrator::open(context(store.clone())).await.unwrap();
        assert_eq!(orchestrator.get_workflow(workflow.id()).await.unwrap().version, 1);

        let closed = orchestrator.get_job(interrupted.id).await.unwrap();
        assert_eq!(closed.state, JobState::Stopped);
        assert!(closed.tasks.iter().all(|t| t.state == TaskState::Skipped));
        assert_eq!(closed.tasks[0].last_error, Some(crate::error::TaskError::Cancelled));
        assert_eq!(
            store.get_job(&interrupted.id).unwrap().unwrap().state,
            JobState::Stopped
        );

        orchestrator.start_job(created.id).await.unwrap();
        let done = orchestrator.wait_for_job(created.id).await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_live_jobs() {
        let (orchestrator, store) = orchestrator().await;
        let workflow = orchestrator
            .create_workflow(definition("slow", vec![sleeper("wait")]))
            .await
            .unwrap();
        let job = orchestrator.create_job(workflow.id).await.unwrap();
        orchestrator.start_job(job.id).await.unwrap();

        orchestrator.shutdown().await;

        let job = orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Stopped);
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().state, JobState::Stopped);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_internal() {
        let (orchestrator, store) = orchestrator().await;
        store.fail_writes(true);

        let err = orchestrator
            .create_workflow(definition("etl", vec![noop("a", &[])]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
        assert_eq!(
            orchestrator
                .list_workflows(&WorkflowFilter::default(), Page::default())
                .await
                .total,
            0
        );
    }
}
