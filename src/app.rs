//! Runtime wiring for the CLI commands.
//!
//! Opens the database, builds the task registry from the configured
//! services, and connects the launcher and the verification scheduler.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use case_ingest_core::execution::{JobParameters, RunStatus, PARAM_CASE_IDS, PARAM_TRIGGER_ID};
use case_ingest_core::partition::is_valid_case_id;

use crate::answers::{AnswerGenerationTask, ANSWER_GENERATION_JOB};
use crate::clients::{HttpAnswerGenerator, HttpBlobUploader, HttpMaterialSource, HttpStatusChecker};
use crate::config::Config;
use crate::db;
use crate::ingest::{CaseIngestionTask, IngestSettings, CASE_INGESTION_JOB};
use crate::launcher::LocalJobLauncher;
use crate::migrate;
use crate::retry::RetryPolicy;
use crate::sqlite_store::SqliteStore;
use crate::traits::TaskRegistry;
use crate::verification::{default_worker_id, SchedulerSettings, VerificationScheduler};

pub struct Runtime {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub launcher: Arc<LocalJobLauncher>,
}

impl Runtime {
    /// Connects, applies migrations, and registers every task whose
    /// services are configured.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let registry = build_registry(&config, &store)?;
        tracing::debug!(tasks = ?registry.names(), "task registry built");
        let launcher = Arc::new(LocalJobLauncher::new(
            store.clone(),
            Arc::new(registry),
            RetryPolicy::from_config(&config.retry),
        ));
        Ok(Self {
            config,
            store,
            launcher,
        })
    }

    pub fn scheduler(&self) -> Result<VerificationScheduler> {
        let verification = &self.config.verification;
        let checker = HttpStatusChecker::from_config(&self.config.services, verification.status_timeout())?;
        let worker_id = verification
            .worker_id
            .clone()
            .unwrap_or_else(default_worker_id);
        Ok(VerificationScheduler::new(
            self.store.clone(),
            self.store.clone(),
            Arc::new(checker),
            self.launcher.clone(),
            SchedulerSettings::from_config(verification),
            worker_id,
        ))
    }

    async fn close(self) {
        self.launcher.wait_idle().await;
        self.store.pool().close().await;
    }
}

pub fn build_registry(config: &Config, store: &Arc<SqliteStore>) -> Result<TaskRegistry> {
    let services = &config.services;
    let mut registry = TaskRegistry::new();

    if services.materials_url.is_some() && services.storage_url.is_some() {
        registry.register(Arc::new(CaseIngestionTask::new(
            store.clone(),
            store.clone(),
            Arc::new(HttpMaterialSource::from_config(services)?),
            Arc::new(HttpBlobUploader::from_config(services)?),
            IngestSettings::from_config(config),
        )))?;
    }
    if services.answers_url.is_some() {
        registry.register(Arc::new(AnswerGenerationTask::new(
            store.clone(),
            Arc::new(HttpAnswerGenerator::from_config(services)?),
            config.pipeline.query_ids.clone(),
            config.pipeline.concurrency,
            config.pipeline.grid_size,
        )))?;
    }
    Ok(registry)
}

/// Sorted, de-duplicated, comma-joined case ids.
pub fn join_case_ids(case_ids: &[String]) -> String {
    let mut ids: Vec<&str> = case_ids
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}

/// `caseingest ingest`: runs the case ingestion job to completion.
pub async fn run_ingest(config: Config, case_ids: Vec<String>) -> Result<()> {
    if config.services.materials_url.is_none() || config.services.storage_url.is_none() {
        bail!("ingest requires services.materials_url and services.storage_url");
    }
    let joined = join_case_ids(&case_ids);
    if joined.is_empty() {
        bail!("at least one case id is required");
    }
    let invalid: Vec<&str> = joined.split(',').filter(|id| !is_valid_case_id(id)).collect();
    if !invalid.is_empty() {
        bail!("case ids must be UUIDs: {}", invalid.join(", "));
    }

    let runtime = Runtime::open(config).await?;
    let params = JobParameters::new()
        .identifying(PARAM_TRIGGER_ID, Uuid::new_v4().to_string())
        .identifying(PARAM_CASE_IDS, joined);
    let outcome = runtime.launcher.run(CASE_INGESTION_JOB, params).await?;

    println!("ingest {}", outcome.handle.run_id);
    println!("  status: {}", outcome.status);
    if let Some(output) = &outcome.output {
        println!("  result: {}", output);
    }
    if let Some(err) = &outcome.error {
        println!("  error:  {}", err);
    }
    runtime.close().await;
    if outcome.status == RunStatus::Failed {
        bail!("ingest run {} failed", outcome.handle.run_id);
    }
    Ok(())
}

fn ensure_trigger_target(config: &Config) -> Result<()> {
    let verification = &config.verification;
    if verification.trigger_answer_job_on_success
        && verification.answer_job_name == ANSWER_GENERATION_JOB
        && config.services.answers_url.is_none()
    {
        bail!(
            "verification triggers '{}' but services.answers_url is not set",
            ANSWER_GENERATION_JOB
        );
    }
    Ok(())
}

/// `caseingest verify once`: a single poll, waiting for any triggered job.
pub async fn run_verify_once(config: Config) -> Result<()> {
    ensure_trigger_target(&config)?;
    let runtime = Runtime::open(config).await?;
    let scheduler = runtime.scheduler()?;
    let report = scheduler.poll_once(Utc::now()).await?;

    println!("verify {}", scheduler.worker_id());
    println!("  claimed:   {}", report.claimed);
    println!("  succeeded: {}", report.succeeded);
    println!("  retried:   {}", report.retried);
    println!("  failed:    {}", report.failed);
    if let Some(run_id) = &report.trigger_run_id {
        println!(
            "  triggered: {} for {}",
            run_id,
            report.ready_case_ids.join(", ")
        );
    }
    runtime.close().await;
    Ok(())
}

/// `caseingest verify run`: the poll loop until Ctrl-C.
pub async fn run_verify_loop(config: Config) -> Result<()> {
    ensure_trigger_target(&config)?;
    let runtime = Runtime::open(config).await?;
    let scheduler = runtime.scheduler()?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = tx.send(true);
    });

    scheduler.run(rx).await;
    runtime.close().await;
    Ok(())
}
