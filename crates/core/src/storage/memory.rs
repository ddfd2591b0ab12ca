use super::index::JobStore;
use crate::types::{Job, JobId, Workflow, WorkflowId};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process [`JobStore`]; nothing survives a restart.
///
/// Writes can be made to fail on demand with [`MemoryStore::fail_writes`].
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    jobs: Mutex<HashMap<JobId, Job>>,
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store is rejecting writes");
        }
        Ok(())
    }
}

impl JobStore for MemoryStore {
    fn put_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.check_writable()?;
        lock(&self.workflows).insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        Ok(lock(&self.workflows).get(id).cloned())
    }

    fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<_> = lock(&self.workflows).values().cloned().collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        self.check_writable()?;
        lock(&self.workflows).remove(id);
        Ok(())
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        lock(&self.jobs).insert(job.id, job.clone());
        Ok(())
    }

    fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(id).cloned())
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<_> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn delete_job(&self, id: &JobId) -> Result<()> {
        self.check_writable()?;
        lock(&self.jobs).remove(id);
        Ok(())
    }
}
