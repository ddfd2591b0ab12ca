use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the orchestration engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size shared by every job
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_max_tasks_per_job")]
    pub max_tasks_per_job: usize,

    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// How long a stopping job waits for in-flight tasks before aborting them
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_max_tasks_per_job() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_inbox_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_tasks_per_job: default_max_tasks_per_job(),
            default_task_timeout_secs: default_task_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            inbox_capacity: default_inbox_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Exponential backoff between attempts of a failing task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempt` (0-based):
    /// base * 2^failed_attempt, capped at `max_delay_ms`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(failed_attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent_tasks": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.max_tasks_per_job, 4);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }
}
