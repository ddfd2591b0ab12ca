use super::actions::{ExecutionRequest, ExecutorRegistry};
use crate::error::TaskError;
use crate::types::{JobId, TaskSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Successful result of one task attempt
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub result: serde_json::Value,
}

/// Runs single task attempts under a timeout and a cancellation token.
///
/// Holds no per-task state; retries are decided by the job controller.
#[derive(Clone)]
pub struct TaskRunner {
    executors: Arc<ExecutorRegistry>,
    default_timeout: Duration,
}

impl TaskRunner {
    pub fn new(executors: Arc<ExecutorRegistry>, default_timeout: Duration) -> Self {
        Self {
            executors,
            default_timeout,
        }
    }

    fn timeout_for(&self, task: &TaskSpec) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Run one attempt of `task`.
    ///
    /// The deadline and `cancel` abort the attempt the same way: the
    /// executor future is dropped. Cancellation wins if both are ready.
    pub async fn run(
        &self,
        job_id: JobId,
        task: &TaskSpec,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        let kind = task.action.kind();
        let executor = self
            .executors
            .get(kind)
            .ok_or_else(|| TaskError::failure(format!("no executor registered for {} actions", kind)))?;

        let request = ExecutionRequest {
            job_id,
            task_id: task.id.clone(),
            attempt,
            action: task.action.clone(),
        };
        let limit = self.timeout_for(task);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(limit) => {
                tracing::warn!(job_id = %job_id, task_id = %task.id, attempt, "Task timed out after {:?}", limit);
                Err(TaskError::Timeout {
                    after_ms: limit.as_millis() as u64,
                })
            }
            result = executor.execute(&request) => match result {
                Ok(result) => Ok(TaskOutcome { result }),
                Err(e) => Err(TaskError::failure(format!("{:#}", e))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskAction;
    use crate::workflow::actions::ActionExecutor;
    use serde_json::{json, Value};

    struct Sleepy(Duration);

    #[async_trait::async_trait]
    impl ActionExecutor for Sleepy {
        async fn execute(&self, _request: &ExecutionRequest) -> anyhow::Result<Value> {
            tokio::time::sleep(self.0).await;
            Ok(json!("done"))
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ActionExecutor for Broken {
        async fn execute(&self, _request: &ExecutionRequest) -> anyhow::Result<Value> {
            anyhow::bail!("disk full")
        }
    }

    fn runner(executor: Arc<dyn ActionExecutor>) -> TaskRunner {
        let registry = ExecutorRegistry::new().with("noop", executor);
        TaskRunner::new(Arc::new(registry), Duration::from_secs(10))
    }

    fn task() -> TaskSpec {
        TaskSpec::new("t", TaskAction::Noop { result: Value::Null })
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_timeout() {
        let runner = runner(Arc::new(Sleepy(Duration::from_secs(1))));
        let outcome = runner
            .run(JobId::new(), &task(), 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result, json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_overrides_default() {
        let runner = runner(Arc::new(Sleepy(Duration::from_secs(5))));
        let err = runner
            .run(JobId::new(), &task().with_timeout_secs(2), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Timeout { after_ms: 2_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_attempt() {
        let runner = runner(Arc::new(Sleepy(Duration::from_secs(60))));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = runner.run(JobId::new(), &task(), 0, &cancel).await.unwrap_err();
        assert_eq!(err, TaskError::Cancelled);
    }

    #[tokio::test]
    async fn test_executor_error_is_execution_failure() {
        let runner = runner(Arc::new(Broken));
        let err = runner
            .run(JobId::new(), &task(), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::failure("disk full"));
    }

    #[tokio::test]
    async fn test_missing_executor_fails_attempt() {
        let runner = TaskRunner::new(Arc::new(ExecutorRegistry::new()), Duration::from_secs(1));
        let err = runner
            .run(JobId::new(), &task(), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_failure");
    }
}
