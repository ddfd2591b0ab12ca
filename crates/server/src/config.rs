use anyhow::{Context, Result};
use conductor_core::events::{EventLog, MemoryEventLog};
use conductor_core::metrics::MetricsCollector;
use conductor_core::storage::{JsonlEventLog, RedbStore};
use conductor_core::workflow::{EngineContext, ExecutorRegistry};
use conductor_core::{EngineConfig, Orchestrator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Base URLs of downstream services used by `service` tasks
    #[serde(default = "default_services")]
    pub services: HashMap<String, String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    /// Keep the event log in memory only
    #[serde(default)]
    pub in_memory_events: bool,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            event_log_dir: default_event_log_dir(),
            in_memory_events: false,
        }
    }
}

fn default_services() -> HashMap<String, String> {
    HashMap::from([
        ("ml".to_string(), "http://localhost:8001".to_string()),
        ("ocr".to_string(), "http://localhost:8002".to_string()),
        ("api_gateway".to_string(), "http://localhost:8000".to_string()),
    ])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            server: HttpConfig::default(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            services: default_services(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load the TOML file at `config_path`, falling back to defaults when
    /// it does not exist.
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbStore::open(config.index_path()).context("Failed to open job store")?,
        );

        let event_log: Arc<dyn EventLog> = if config.storage.in_memory_events {
            Arc::new(MemoryEventLog::new())
        } else {
            Arc::new(
                JsonlEventLog::new(config.event_log_path())
                    .context("Failed to create event log")?,
            )
        };

        let executors = Arc::new(
            ExecutorRegistry::with_defaults(config.services.clone())
                .context("Failed to build task executors")?,
        );

        let ctx = EngineContext::new(
            config.engine.clone(),
            store,
            event_log,
            Arc::new(MetricsCollector::new()),
            executors,
        );
        let orchestrator = Orchestrator::open(ctx)
            .await
            .context("Failed to load persisted state")?;

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
        })
    }

    #[cfg(test)]
    pub fn from_orchestrator(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}
