//! Executors for the opaque work carried by a task.
//!
//! The engine never looks inside a [`TaskAction`]: it asks the
//! [`ExecutorRegistry`] for the executor registered under the action's
//! kind tag and hands the whole request over.

use crate::types::{JobId, TaskAction, TaskId};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an executor needs to perform one attempt
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// 0-based attempt number
    pub attempt: u32,
    pub action: TaskAction,
}

/// Performs the work behind one kind of task action.
///
/// Implementations must be cancel-safe: the runner drops the returned
/// future on timeout or cancellation.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value>;
}

/// Executors keyed by action kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `script`, `http`, `service` and `noop` executors
    pub fn with_defaults(services: HashMap<String, String>) -> Result<Self> {
        let http = Arc::new(HttpExecutor::new(services)?);
        Ok(Self::new()
            .with("script", Arc::new(ScriptExecutor))
            .with("http", http.clone())
            .with("service", http)
            .with("noop", Arc::new(NoopExecutor)))
    }

    pub fn with(mut self, kind: impl Into<String>, executor: Arc<dyn ActionExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.get(kind).cloned()
    }
}

/// Returns the action's configured result
pub struct NoopExecutor;

#[async_trait::async_trait]
impl ActionExecutor for NoopExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value> {
        match &request.action {
            TaskAction::Noop { result } => Ok(result.clone()),
            other => bail!("noop executor cannot run {} actions", other.kind()),
        }
    }
}

/// Runs a subprocess; stdout becomes the result.
///
/// Output that parses as JSON is returned as JSON, anything else as a
/// string. The child is killed if the attempt is abandoned.
pub struct ScriptExecutor;

#[async_trait::async_trait]
impl ActionExecutor for ScriptExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value> {
        let TaskAction::Script { command, args } = &request.action else {
            bail!("script executor cannot run {} actions", request.action.kind());
        };

        tracing::debug!(
            job_id = %request.job_id,
            task_id = %request.task_id,
            attempt = request.attempt,
            "Spawning {}",
            command
        );

        let output = tokio::process::Command::new(command)
            .args(args)
            .env("CONDUCTOR_JOB_ID", request.job_id.to_string())
            .env("CONDUCTOR_TASK_ID", &request.task_id.0)
            .env("CONDUCTOR_ATTEMPT", request.attempt.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", command, output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

/// Calls HTTP endpoints, either by URL or through a named service.
///
/// Service names (`ml`, `ocr`, ...) resolve to base URLs from configuration.
pub struct HttpExecutor {
    client: reqwest::Client,
    services: HashMap<String, String>,
}

impl HttpExecutor {
    pub fn new(services: HashMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, services })
    }

    fn service_url(&self, service: &str, path: &str) -> Result<String> {
        let base = self
            .services
            .get(service)
            .ok_or_else(|| anyhow!("no base URL configured for service {}", service))?;
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn send(&self, method: &str, url: &str, body: Option<&Value>) -> Result<Value> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method {}", method))?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            bail!("{} returned {}: {}", url, status, text);
        }

        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait::async_trait]
impl ActionExecutor for HttpExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value> {
        match &request.action {
            TaskAction::Http { method, url, body } => self.send(method, url, body.as_ref()).await,
            TaskAction::Service {
                service,
                path,
                payload,
            } => {
                let url = self.service_url(service, path)?;
                self.send("POST", &url, payload.as_ref()).await
            }
            other => bail!("http executor cannot run {} actions", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(action: TaskAction) -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::new(),
            task_id: TaskId::new("t"),
            attempt: 0,
            action,
        }
    }

    #[tokio::test]
    async fn test_noop_returns_result() {
        let value = NoopExecutor
            .execute(&request(TaskAction::Noop {
                result: json!({"ok": true}),
            }))
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_service_call_uses_configured_base_url() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/classify"))
            .and(body_json(json!({"text": "invoice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"label": "finance"})))
            .mount(&server)
            .await;

        let services = HashMap::from([("ml".to_string(), format!("{}/", server.uri()))]);
        let executor = HttpExecutor::new(services).unwrap();

        let value = executor
            .execute(&request(TaskAction::Service {
                service: "ml".to_string(),
                path: "/v1/classify".to_string(),
                payload: Some(json!({"text": "invoice"})),
            }))
            .await
            .unwrap();

        assert_eq!(value["label"], "finance");
    }

    #[tokio::test]
    async fn test_http_error_status_is_a_failure() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let executor = HttpExecutor::new(HashMap::new()).unwrap();
        let err = executor
            .execute(&request(TaskAction::Http {
                method: "get".to_string(),
                url: format!("{}/health", server.uri()),
                body: None,
            }))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_unknown_service_is_a_failure() {
        let executor = HttpExecutor::new(HashMap::new()).unwrap();
        let err = executor
            .execute(&request(TaskAction::Service {
                service: "ocr".to_string(),
                path: "scan".to_string(),
                payload: None,
            }))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ocr"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_stdout_becomes_result() {
        let value = ScriptExecutor
            .execute(&request(TaskAction::Script {
                command: "echo".to_string(),
                args: vec![r#"{"rows": 3}"#.to_string()],
            }))
            .await
            .unwrap();
        assert_eq!(value, json!({"rows": 3}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_non_zero_exit_fails() {
        let err = ScriptExecutor
            .execute(&request(TaskAction::Script {
                command: "false".to_string(),
                args: vec![],
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("false exited"));
    }

    #[test]
    fn test_default_registry_covers_every_kind() {
        let registry = ExecutorRegistry::with_defaults(HashMap::new()).unwrap();
        for kind in ["script", "http", "service", "noop"] {
            assert!(registry.get(kind).is_some(), "missing {kind}");
        }
    }
}
