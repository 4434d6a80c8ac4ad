//! In-process job launcher.
//!
//! Every start is first recorded in `job_instances`, keyed by job name and
//! the hash of the identifying parameters. A second start with the same key
//! returns the existing run and executes nothing, which is what makes the
//! scheduler's downstream trigger exactly-once per trigger id.
//!
//! Tasks run wrapped in [`Retrying`] and their final status (`COMPLETED` or
//! `FAILED`) is written back to the instance row.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use case_ingest_core::execution::{ExecutionRecord, JobParameters, RunStatus};

use crate::retry::{RetryPolicy, Retrying};
use crate::sqlite_store::SqliteStore;
use crate::traits::{JobTrigger, RunHandle, Task, TaskRegistry};

/// Result of running a job to completion.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    #[serde(flatten)]
    pub handle: RunHandle,
    pub status: RunStatus,
    /// Task output; `None` when the run already existed or failed.
    pub output: Option<Value>,
    pub error: Option<String>,
}

pub struct LocalJobLauncher {
    store: Arc<SqliteStore>,
    registry: Arc<TaskRegistry>,
    policy: RetryPolicy,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalJobLauncher {
    pub fn new(store: Arc<SqliteStore>, registry: Arc<TaskRegistry>, policy: RetryPolicy) -> Self {
        Self {
            store,
            registry,
            policy,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    fn resolve(&self, job_name: &str) -> Result<Arc<dyn Task>> {
        match self.registry.get(job_name) {
            Some(task) => Ok(Arc::new(Retrying::new(task, self.policy.clone()))),
            None => bail!(
                "unknown job '{}' (registered: {})",
                job_name,
                self.registry.names().join(", ")
            ),
        }
    }

    /// Records and runs a job in the current task, waiting for the result.
    pub async fn run(&self, job_name: &str, params: JobParameters) -> Result<RunOutcome> {
        let task = self.resolve(job_name)?;
        let handle = self.store.create_job_instance(job_name, &params).await?;
        if !handle.created {
            let status = self
                .store
                .job_status(&handle.run_id)
                .await?
                .unwrap_or(RunStatus::Starting);
            tracing::info!(job = job_name, run_id = %handle.run_id, status = %status, "job instance already exists");
            return Ok(RunOutcome {
                handle,
                status,
                output: None,
                error: None,
            });
        }
        let record = ExecutionRecord::new(job_name, &handle.run_id, params);
        let (status, output, error) = execute(&self.store, task, record).await;
        Ok(RunOutcome {
            handle,
            status,
            output,
            error,
        })
    }

    /// Waits for every run started through [`JobTrigger::start`].
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = self.in_flight.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "job task panicked");
            }
        }
    }
}

async fn execute(
    store: &SqliteStore,
    task: Arc<dyn Task>,
    record: ExecutionRecord,
) -> (RunStatus, Option<Value>, Option<String>) {
    let run_id = record.run_id.clone();
    let job_name = record.job_name.clone();
    let running = record.with_status(RunStatus::Running);
    if let Err(e) = store.set_job_status(&run_id, RunStatus::Running, None).await {
        tracing::warn!(run_id = %run_id, error = %e, "failed to mark run as running");
    }
    tracing::info!(job = %job_name, run_id = %run_id, "job started");

    let (status, output, error) = match task.execute(&running).await {
        Ok(output) => (RunStatus::Completed, Some(output), None),
        Err(e) => (RunStatus::Failed, None, Some(format!("{:#}", e))),
    };

    if let Err(e) = store.set_job_status(&run_id, status, error.as_deref()).await {
        tracing::error!(run_id = %run_id, error = %e, "failed to record job status");
    }
    match &error {
        None => tracing::info!(job = %job_name, run_id = %run_id, "job completed"),
        Some(err) => tracing::error!(job = %job_name, run_id = %run_id, error = %err, "job failed"),
    }
    (status, output, error)
}

#[async_trait]
impl JobTrigger for LocalJobLauncher {
    /// Records the instance and runs it in the background.
    async fn start(&self, job_name: &str, params: JobParameters) -> Result<RunHandle> {
        let task = self.resolve(job_name)?;
        let handle = self.store.create_job_instance(job_name, &params).await?;
        if !handle.created {
            tracing::info!(job = job_name, run_id = %handle.run_id, "job already started for these parameters");
            return Ok(handle);
        }

        let store = self.store.clone();
        let record = ExecutionRecord::new(job_name, &handle.run_id, params);
        let join = tokio::spawn(async move {
            execute(&store, task, record).await;
        });

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(join);
        Ok(handle)
    }
}
