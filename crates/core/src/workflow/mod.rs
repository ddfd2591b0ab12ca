pub mod actions;
pub mod controller;
pub mod dag;
pub mod runner;
pub mod scheduler;

pub use actions::{
    ActionExecutor, ExecutionRequest, ExecutorRegistry, HttpExecutor, NoopExecutor, ScriptExecutor,
};
pub use controller::{close_interrupted, create_job, EngineContext, JobHandle};
pub use dag::{ValidatedWorkflow, WorkflowDag};
pub use runner::{TaskOutcome, TaskRunner};
pub use scheduler::{next_eligible, Decision};
