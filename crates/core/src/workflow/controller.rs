//! Per-job actor.
//!
//! Every live job is owned by one [`JobController`] running on its own
//! tokio task. Requests arrive through a bounded inbox, attempt results
//! through a `JoinSet`, so all mutations of one job happen sequentially
//! without locks. Readers never talk to the actor: the latest snapshot is
//! published on a `watch` channel.

use super::actions::ExecutorRegistry;
use super::dag::ValidatedWorkflow;
use super::runner::{TaskOutcome, TaskRunner};
use super::scheduler::next_eligible;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StateError, TaskError};
use crate::events::{Event, EventLog, EventType};
use crate::metrics::MetricsCollector;
use crate::storage::JobStore;
use crate::types::{Job, JobId, JobState, TaskFailure, TaskRun, TaskState};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every job controller
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn JobStore>,
    pub event_log: Arc<dyn EventLog>,
    pub metrics: Arc<MetricsCollector>,
    pub runner: TaskRunner,
    /// Global worker pool; one permit per running attempt
    pub pool: Arc<Semaphore>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        event_log: Arc<dyn EventLog>,
        metrics: Arc<MetricsCollector>,
        executors: Arc<ExecutorRegistry>,
    ) -> Self {
        // A zero limit would never dispatch anything
        let mut config = config;
        config.max_tasks_per_job = config.max_tasks_per_job.max(1);

        let runner = TaskRunner::new(executors, config.default_task_timeout());
        let pool = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            config: Arc::new(config),
            store,
            event_log,
            metrics,
            runner,
            pool,
        }
    }
}

/// New job for `workflow`: state `created`, one `pending` run per task.
pub fn create_job(workflow: &ValidatedWorkflow) -> Job {
    Job {
        id: JobId::new(),
        workflow_id: workflow.id(),
        workflow_version: workflow.version(),
        state: JobState::Created,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        tasks: workflow
            .tasks()
            .iter()
            .map(|t| TaskRun::pending(t.id.clone()))
            .collect(),
        failures: Vec::new(),
    }
}

/// Close a job that was live when the engine went down.
///
/// The job becomes `stopped`; runs that were in flight are recorded as
/// cancelled and every unfinished run is skipped. Returns the events to log.
pub fn close_interrupted(job: &mut Job, reason: &str) -> Vec<EventType> {
    let now = Utc::now();
    let mut events = Vec::new();

    for run in job.tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
        if run.state == TaskState::Running {
            run.last_error = Some(TaskError::Cancelled);
        }
        run.state = TaskState::Skipped;
        run.finished_at = Some(now);
        events.push(EventType::TaskSkipped {
            task_id: run.task_id.clone(),
            reason: reason.to_string(),
        });
    }

    job.state = JobState::Stopped;
    job.finished_at = Some(now);
    events.push(EventType::JobStopped {
        reason: reason.to_string(),
    });
    events
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<Job>>,
    },
    Halt {
        terminal: JobState,
        reply: oneshot::Sender<Result<Job>>,
    },
}

/// Cheap, cloneable reference to a job and its controller.
#[derive(Clone)]
pub struct JobHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Job>,
}

impl JobHandle {
    /// Spawn a controller for a job in state `created`
    pub fn spawn(ctx: EngineContext, workflow: Arc<ValidatedWorkflow>, job: Job) -> Self {
        let (commands, inbox) = mpsc::channel(ctx.config.inbox_capacity.max(1));
        let (snapshots, snapshot) = watch::channel(job.clone());

        let controller = JobController {
            eligible_since: vec![None; job.tasks.len()],
            ctx,
            workflow,
            job,
            inbox,
            inbox_open: true,
            snapshots,
            cancel: CancellationToken::new(),
            runners: JoinSet::new(),
            in_flight: HashMap::new(),
            retry_timers: JoinSet::new(),
            retry_ready: VecDeque::new(),
            spare_permit: None,
            waiting_for_pool: false,
            effects: Effects::default(),
            dirty: false,
        };
        tokio::spawn(controller.run());

        Self { commands, snapshot }
    }

    /// Handle for a job that is already terminal; no controller is spawned.
    pub fn finished(job: Job) -> Self {
        let (commands, _) = mpsc::channel(1);
        let (_, snapshot) = watch::channel(job);
        Self { commands, snapshot }
    }

    pub fn snapshot(&self) -> Job {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> JobState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.snapshot.clone()
    }

    /// `created -> running`; any other state is an [`StateError::InvalidTransition`].
    pub async fn start(&self) -> Result<Job> {
        match self.request(|reply| Command::Start { reply }).await {
            Some(result) => result,
            None => {
                let job = self.snapshot();
                Err(StateError::InvalidTransition {
                    job_id: job.id,
                    from: job.state,
                    operation: "start",
                }
                .into())
            }
        }
    }

    /// Stop the job. Returns once in-flight attempts have reported back or
    /// were aborted; on a terminal job it returns the current snapshot.
    pub async fn stop(&self) -> Result<Job> {
        self.halt(JobState::Stopped).await
    }

    /// Same as [`Self::stop`] with terminal state `cancelled`
    pub async fn cancel(&self) -> Result<Job> {
        self.halt(JobState::Cancelled).await
    }

    /// Wait until the job and all of its task runs are terminal
    pub async fn wait_until_settled(&self) -> Job {
        let mut snapshot = self.snapshot.clone();
        if let Ok(job) = snapshot
            .wait_for(|job| job.state.is_terminal() && job.tasks.iter().all(|t| t.state.is_terminal()))
            .await
        {
            return job.clone();
        }
        let job = snapshot.borrow().clone();
        job
    }

    async fn halt(&self, terminal: JobState) -> Result<Job> {
        match self.request(|reply| Command::Halt { terminal, reply }).await {
            Some(result) => result,
            // Controller exits only once the job is terminal
            None => Ok(self.snapshot()),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<Job>>) -> Command,
    ) -> Option<Result<Job>> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        response.await.ok()
    }
}

/// Side effects of a state change, applied once the change is committed
#[derive(Default)]
struct Effects {
    events: Vec<EventType>,
    task_transitions: Vec<(TaskState, TaskState)>,
    job_transitions: Vec<(JobState, JobState)>,
}

impl Effects {
    fn is_empty(&self) -> bool {
        self.events.is_empty() && self.task_transitions.is_empty() && self.job_transitions.is_empty()
    }

    fn merge(&mut self, other: Effects) {
        self.events.extend(other.events);
        self.task_transitions.extend(other.task_transitions);
        self.job_transitions.extend(other.job_transitions);
    }

    fn set_task(&mut self, job: &mut Job, idx: usize, to: TaskState) {
        let from = std::mem::replace(&mut job.tasks[idx].state, to);
        self.task_transitions.push((from, to));
    }

    fn set_job(&mut self, job: &mut Job, to: JobState) {
        let from = std::mem::replace(&mut job.state, to);
        self.job_transitions.push((from, to));
    }

    fn skip_task(&mut self, job: &mut Job, idx: usize, reason: &str) {
        job.tasks[idx].finished_at = Some(Utc::now());
        self.set_task(job, idx, TaskState::Skipped);
        self.events.push(EventType::TaskSkipped {
            task_id: job.tasks[idx].task_id.clone(),
            reason: reason.to_string(),
        });
    }
}

type AttemptResult = (std::result::Result<TaskOutcome, TaskError>, Duration);

struct JobController {
    ctx: EngineContext,
    workflow: Arc<ValidatedWorkflow>,
    job: Job,
    inbox: mpsc::Receiver<Command>,
    inbox_open: bool,
    snapshots: watch::Sender<Job>,
    cancel: CancellationToken,
    runners: JoinSet<AttemptResult>,
    in_flight: HashMap<task::Id, usize>,
    retry_timers: JoinSet<usize>,
    /// Queued tasks whose backoff elapsed; dispatched before new work
    retry_ready: VecDeque<usize>,
    eligible_since: Vec<Option<Instant>>,
    spare_permit: Option<OwnedSemaphorePermit>,
    waiting_for_pool: bool,
    effects: Effects,
    /// Last snapshot could not be persisted
    dirty: bool,
}

impl JobController {
    async fn run(mut self) {
        tracing::debug!(job_id = %self.job.id, "Job controller started");

        loop {
            if self.job.state == JobState::Running {
                self.schedule();
                self.checkpoint().await;
            }

            if self.job.state.is_terminal() && self.runners.is_empty() {
                break;
            }

            tokio::select! {
                command = self.inbox.recv(), if self.inbox_open => match command {
                    Some(Command::Start { reply }) => self.start(reply).await,
                    Some(Command::Halt { terminal, reply }) => self.halt(terminal, Some(reply)).await,
                    None => {
                        self.inbox_open = false;
                        self.halt(JobState::Stopped, None).await;
                    }
                },
                Some(joined) = self.runners.join_next_with_id(), if !self.runners.is_empty() => {
                    self.on_runner_exit(joined);
                }
                Some(ready) = self.retry_timers.join_next(), if !self.retry_timers.is_empty() => {
                    if let Ok(idx) = ready {
                        self.eligible_since[idx] = Some(Instant::now());
                        self.retry_ready.push_back(idx);
                    }
                }
                permit = self.ctx.pool.clone().acquire_owned(), if self.waiting_for_pool => {
                    self.spare_permit = permit.ok();
                }
                else => break,
            }
        }

        if self.dirty {
            self.persist();
        }

        tracing::debug!(job_id = %self.job.id, state = %self.job.state, "Job controller finished");
    }

    async fn start(&mut self, reply: oneshot::Sender<Result<Job>>) {
        if self.job.state != JobState::Created {
            let _ = reply.send(Err(StateError::InvalidTransition {
                job_id: self.job.id,
                from: self.job.state,
                operation: "start",
            }
            .into()));
            return;
        }

        let mut staged = self.job.clone();
        let mut effects = Effects::default();
        effects.set_job(&mut staged, JobState::Running);
        staged.started_at = Some(Utc::now());
        effects.events.push(EventType::JobStarted);

        if let Err(e) = self.stage(&staged, "start") {
            let _ = reply.send(Err(e));
            return;
        }

        self.job = staged;
        self.effects.merge(effects);
        tracing::info!(job_id = %self.job.id, workflow_id = %self.job.workflow_id, "Job started");

        self.schedule();
        self.checkpoint().await;
        let _ = reply.send(Ok(self.job.clone()));
    }

    /// Stop or cancel. `reply` is `None` when every handle was dropped.
    async fn halt(&mut self, terminal: JobState, reply: Option<oneshot::Sender<Result<Job>>>) {
        if self.job.state.is_terminal() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(self.job.clone()));
            }
            return;
        }

        let reason = match (terminal, &reply) {
            (JobState::Cancelled, _) => "job cancelled",
            (_, Some(_)) => "job stopped",
            (_, None) => "job controller shut down",
        };

        let mut staged = self.job.clone();
        let mut effects = Effects::default();
        effects.set_job(&mut staged, terminal);
        staged.finished_at = Some(Utc::now());

        let decision = next_eligible(self.workflow.dag(), &staged.tasks, terminal, 0);
        for idx in decision.skip {
            effects.skip_task(&mut staged, idx, reason);
        }
        effects.events.push(match terminal {
            JobState::Cancelled => EventType::JobCancelled {
                reason: reason.to_string(),
            },
            _ => EventType::JobStopped {
                reason: reason.to_string(),
            },
        });

        if let Err(e) = self.stage(&staged, terminal.as_str()) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }

        self.job = staged;
        self.effects.merge(effects);
        tracing::info!(
            job_id = %self.job.id,
            in_flight = self.in_flight.len(),
            "Job {}",
            terminal
        );

        self.cancel.cancel();
        self.retry_timers.abort_all();
        self.retry_ready.clear();
        self.waiting_for_pool = false;
        self.spare_permit = None;
        self.checkpoint().await;

        self.drain().await;
        self.checkpoint().await;

        if let Some(reply) = reply {
            let _ = reply.send(Ok(self.job.clone()));
        }
    }

    /// Persist a request-driven transition before it is committed.
    fn stage(&self, staged: &Job, operation: &str) -> Result<()> {
        self.ctx.store.put_job(staged).map_err(|e| {
            self.ctx.metrics.store_error("put_job");
            tracing::error!(job_id = %staged.id, "Failed to persist {} of job: {:#}", operation, e);
            EngineError::Internal(e.context(format!("Failed to persist {} of job {}", operation, staged.id)))
        })
    }

    /// Wait for cancelled attempts to report back, aborting stragglers
    /// once the grace period has elapsed.
    async fn drain(&mut self) {
        let deadline = Instant::now() + self.ctx.config.cancel_grace();

        while !self.runners.is_empty() {
            tokio::select! {
                Some(joined) = self.runners.join_next_with_id() => self.on_runner_exit(joined),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        job_id = %self.job.id,
                        remaining = self.runners.len(),
                        "Aborting tasks still running after grace period"
                    );
                    self.runners.abort_all();
                    while let Some(joined) = self.runners.join_next_with_id().await {
                        self.on_runner_exit(joined);
                    }
                }
            }
        }
    }

    /// One scheduling pass: cascade skips, dispatch what fits, and settle
    /// the job once every task run is terminal.
    fn schedule(&mut self) {
        let headroom = self
            .ctx
            .config
            .max_tasks_per_job
            .saturating_sub(self.in_flight.len());
        let decision = next_eligible(self.workflow.dag(), &self.job.tasks, self.job.state, headroom);

        for idx in decision.skip {
            self.effects.skip_task(&mut self.job, idx, "dependency did not succeed");
        }

        let now = Instant::now();
        for &idx in decision.dispatch.iter().chain(&decision.deferred) {
            self.eligible_since[idx].get_or_insert(now);
        }

        let mut budget = headroom;
        let mut blocked = false;

        let retries = std::mem::take(&mut self.retry_ready);
        for idx in retries {
            if self.job.tasks[idx].state != TaskState::Queued {
                continue;
            }
            let permit = if budget > 0 && !blocked {
                self.take_permit()
            } else {
                None
            };
            match permit {
                Some(permit) => {
                    self.dispatch(idx, permit);
                    budget -= 1;
                }
                None => {
                    blocked |= budget > 0;
                    self.retry_ready.push_back(idx);
                }
            }
        }

        for idx in decision.dispatch {
            if budget == 0 || blocked {
                break;
            }
            match self.take_permit() {
                Some(permit) => {
                    self.dispatch(idx, permit);
                    budget -= 1;
                }
                None => blocked = true,
            }
        }

        self.waiting_for_pool = blocked;
        self.spare_permit = None;

        if self.job.state == JobState::Running && self.job.tasks.iter().all(|t| t.state.is_terminal()) {
            self.settle();
        }
    }

    fn take_permit(&mut self) -> Option<OwnedSemaphorePermit> {
        self.spare_permit
            .take()
            .or_else(|| self.ctx.pool.clone().try_acquire_owned().ok())
    }

    fn dispatch(&mut self, idx: usize, permit: OwnedSemaphorePermit) {
        let run = &mut self.job.tasks[idx];
        let attempt = run.attempts;
        run.attempts += 1;
        run.started_at = Some(Utc::now());
        run.finished_at = None;
        let task_id = run.task_id.clone();

        self.effects.set_task(&mut self.job, idx, TaskState::Running);
        self.effects.events.push(EventType::TaskStarted {
            task_id: task_id.clone(),
            attempt,
        });
        if let Some(since) = self.eligible_since[idx].take() {
            self.ctx.metrics.dispatch_latency(since.elapsed());
        }
        self.ctx.metrics.tasks_in_flight(1.0);

        tracing::info!(job_id = %self.job.id, task_id = %task_id, attempt, "Dispatching task");

        let runner = self.ctx.runner.clone();
        let workflow = self.workflow.clone();
        let cancel = self.cancel.clone();
        let job_id = self.job.id;

        let handle = self.runners.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = runner.run(job_id, workflow.task(idx), attempt, &cancel).await;
            (outcome, started.elapsed())
        });
        self.in_flight.insert(handle.id(), idx);
    }

    fn on_runner_exit(&mut self, joined: std::result::Result<(task::Id, AttemptResult), JoinError>) {
        let (id, (outcome, elapsed)) = match joined {
            Ok(done) => done,
            Err(err) => {
                let error = if err.is_cancelled() {
                    TaskError::Cancelled
                } else {
                    TaskError::failure("task runner panicked")
                };
                (err.id(), (Err(error), Duration::ZERO))
            }
        };

        let Some(idx) = self.in_flight.remove(&id) else {
            return;
        };
        self.ctx.metrics.tasks_in_flight(-1.0);
        self.complete_task(idx, outcome, elapsed);
    }

    fn complete_task(
        &mut self,
        idx: usize,
        outcome: std::result::Result<TaskOutcome, TaskError>,
        elapsed: Duration,
    ) {
        let job_id = self.job.id;
        let retry_limit = self.workflow.task(idx).retry_limit;
        let task_id = self.job.tasks[idx].task_id.clone();
        let attempt = self.job.tasks[idx].attempts.saturating_sub(1);
        self.job.tasks[idx].finished_at = Some(Utc::now());

        let error = match outcome {
            Ok(outcome) => {
                let run = &mut self.job.tasks[idx];
                run.result = Some(outcome.result);
                run.last_error = None;
                self.effects.set_task(&mut self.job, idx, TaskState::Succeeded);
                self.effects.events.push(EventType::TaskSucceeded {
                    task_id: task_id.clone(),
                    attempt,
                    duration_ms: elapsed.as_millis() as u64,
                });
                self.ctx.metrics.task_duration("succeeded", elapsed);
                tracing::info!(job_id = %job_id, task_id = %task_id, attempt, "Task succeeded in {:?}", elapsed);
                return;
            }
            Err(error) => error,
        };

        self.job.tasks[idx].last_error = Some(error.clone());
        self.ctx.metrics.task_error(error.kind());
        self.ctx.metrics.task_duration(error.kind(), elapsed);

        if self.job.state != JobState::Running {
            // Stopping: no retries, cancellation means the task never finished
            if error == TaskError::Cancelled {
                self.effects.skip_task(&mut self.job, idx, "cancelled while running");
            } else {
                self.fail_task(idx, attempt, error);
            }
            return;
        }

        if !error.counts_against_retries() {
            self.job.tasks[idx].attempts = attempt;
            self.effects.set_task(&mut self.job, idx, TaskState::Pending);
            return;
        }

        if attempt < retry_limit {
            let delay = self.ctx.config.retry.backoff(attempt);
            tracing::warn!(
                job_id = %job_id,
                task_id = %task_id,
                attempt,
                "Task failed: {}; retrying in {:?}",
                error,
                delay
            );

            self.effects.set_task(&mut self.job, idx, TaskState::Queued);
            self.effects.events.push(EventType::TaskFailed {
                task_id: task_id.clone(),
                attempt,
                error,
                will_retry: true,
            });
            self.effects.events.push(EventType::TaskQueued {
                task_id,
                attempt: attempt + 1,
            });
            self.retry_timers.spawn(async move {
                tokio::time::sleep(delay).await;
                idx
            });
        } else {
            self.fail_task(idx, attempt, error);
        }
    }

    fn fail_task(&mut self, idx: usize, attempt: u32, error: TaskError) {
        let task_id = self.job.tasks[idx].task_id.clone();
        tracing::error!(
            job_id = %self.job.id,
            task_id = %task_id,
            attempts = attempt + 1,
            "Task failed: {}",
            error
        );

        self.effects.set_task(&mut self.job, idx, TaskState::Failed);
        self.effects.events.push(EventType::TaskFailed {
            task_id: task_id.clone(),
            attempt,
            error: error.clone(),
            will_retry: false,
        });
        self.job.failures.push(TaskFailure { task_id, error });
    }

    /// Every task run is terminal: decide the job's outcome.
    fn settle(&mut self) {
        let finished_at = Utc::now();
        self.job.finished_at = Some(finished_at);

        if self.job.tasks.iter().all(|t| t.state == TaskState::Succeeded) {
            let duration_ms = self
                .job
                .started_at
                .map(|started| (finished_at - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.effects.set_job(&mut self.job, JobState::Succeeded);
            self.effects.events.push(EventType::JobSucceeded { duration_ms });
            tracing::info!(job_id = %self.job.id, "Job succeeded in {}ms", duration_ms);
        } else {
            self.effects.set_job(&mut self.job, JobState::Failed);
            self.effects.events.push(EventType::JobFailed {
                failures: self.job.failures.clone(),
            });
            tracing::warn!(
                job_id = %self.job.id,
                failed = self.job.failures.len(),
                "Job failed"
            );
        }
    }

    /// Apply pending effects: persist the job, log events, then publish.
    async fn checkpoint(&mut self) {
        if self.effects.is_empty() && !self.dirty {
            return;
        }

        let effects = std::mem::take(&mut self.effects);
        for (from, to) in &effects.task_transitions {
            self.ctx.metrics.task_transition(from.as_str(), to.as_str());
        }
        for (from, to) in &effects.job_transitions {
            self.ctx.metrics.job_transition(from.as_str(), to.as_str());
        }

        self.persist();

        for event_type in effects.events {
            let name = event_type.name();
            if let Err(e) = self.ctx.event_log.append(Event::new(self.job.id, event_type)).await {
                tracing::warn!(job_id = %self.job.id, "Failed to append {} event: {:#}", name, e);
            }
        }

        // Readers that observe a snapshot also find it stored and logged
        self.snapshots.send_replace(self.job.clone());
    }

    /// Completion-driven writes: failures are logged and retried with the
    /// next snapshot.
    fn persist(&mut self) {
        match self.ctx.store.put_job(&self.job) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                self.dirty = true;
                self.ctx.metrics.store_error("put_job");
                tracing::error!(job_id = %self.job.id, "Failed to persist job snapshot: {:#}", e);
            }
        }
    }
}
