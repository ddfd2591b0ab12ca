use crate::types::{Job, JobId, Workflow, WorkflowId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKFLOWS_TABLE: Table = TableDefinition::new("workflows");
const JOBS_TABLE: Table = TableDefinition::new("jobs");

/// Durable storage for workflows and job snapshots.
///
/// Every `put` must be visible to a subsequent `get` on the same store.
pub trait JobStore: Send + Sync {
    fn put_workflow(&self, workflow: &Workflow) -> Result<()>;

    fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>>;

    /// All workflows, most recently created first
    fn list_workflows(&self) -> Result<Vec<Workflow>>;

    fn delete_workflow(&self, id: &WorkflowId) -> Result<()>;

    fn put_job(&self, job: &Job) -> Result<()>;

    fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// All jobs, most recently created first
    fn list_jobs(&self) -> Result<Vec<Job>>;

    fn delete_job(&self, id: &JobId) -> Result<()>;
}

/// [`JobStore`] backed by an embedded redb database, values stored as JSON
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_vec(value).context("Failed to serialize record")?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .with_context(|| format!("Failed to deserialize record {}", key))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            records.push(serde_json::from_slice(value.value()).context("Failed to deserialize record")?);
        }
        Ok(records)
    }

    fn delete(&self, table: Table, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table.remove(key).context("Failed to delete record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

impl JobStore for RedbStore {
    fn put_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.put(WORKFLOWS_TABLE, &workflow.id.to_string(), workflow)
    }

    fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        self.get(WORKFLOWS_TABLE, &id.to_string())
    }

    fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self.list(WORKFLOWS_TABLE)?;
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    fn delete_workflow(&self, id: &WorkflowId) -> Result<()> {
        self.delete(WORKFLOWS_TABLE, &id.to_string())
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        self.put(JOBS_TABLE, &job.id.to_string(), job)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.get(JOBS_TABLE, &id.to_string())
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.list(JOBS_TABLE)?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn delete_job(&self, id: &JobId) -> Result<()> {
        self.delete(JOBS_TABLE, &id.to_string())
    }
}
