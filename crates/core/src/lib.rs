// Core engine for Conductor: workflow DAGs, per-job controllers and storage

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, RetryPolicy};
pub use error::{EngineError, Result, StateError, TaskError, ValidationError};
pub use orchestrator::Orchestrator;
pub use types::*;
