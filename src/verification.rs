//! Verification scheduler.
//!
//! Polls the verification queue on a fixed delay. Each poll claims a
//! bounded batch of tasks under a time-bound lease, asks the ingestion
//! status service about each task's blob, advances the task's state, and,
//! when at least one document became ready, starts the answer-generation
//! job once for exactly the cases that became ready in that poll.
//!
//! # Task state machine
//!
//! ```text
//!             claim                 success sentinel
//!  PENDING ──────────▶ IN_PROGRESS ─────────────────▶ SUCCEEDED
//!     ▲                    │   │
//!     └── lease expiry ────┘   │ attempt_count > max_attempts
//!         or save (unlock)     └─────────────────────────────▶ FAILED
//! ```
//!
//! Errors, timeouts, and "no status yet" count against `max_attempts`.
//! Any other status reported by the service is recorded and retried
//! without consuming an attempt.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use case_ingest_core::execution::{JobParameters, PARAM_CASE_IDS, PARAM_TRIGGER_ID};
use case_ingest_core::models::{IngestionPhase, VerificationStatus, VerificationTask};
use case_ingest_core::store::{DocumentStore, VerificationQueue};

use crate::config::VerificationConfig;
use crate::traits::{IngestionStatusChecker, JobTrigger};

/// Runtime settings of one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub delay: Duration,
    pub batch_size: usize,
    pub lock_ttl: chrono::Duration,
    pub retry_delay: chrono::Duration,
    pub status_timeout: Duration,
    pub trigger_answer_job_on_success: bool,
    pub answer_job_name: String,
}

impl SchedulerSettings {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            enabled: config.enabled,
            delay: config.delay(),
            batch_size: config.batch_size,
            lock_ttl: config.lock_ttl(),
            retry_delay: config.retry_delay(),
            status_timeout: config.status_timeout(),
            trigger_answer_job_on_success: config.trigger_answer_job_on_success,
            answer_job_name: config.answer_job_name.clone(),
        }
    }
}

/// Summary of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Distinct case ids whose documents became ready in this poll.
    pub ready_case_ids: Vec<String>,
    /// Run started for the ready cases, if any.
    pub trigger_run_id: Option<String>,
}

enum CheckOutcome {
    /// The service reported the success sentinel.
    Ingested(String),
    /// A valid status that is not success yet.
    Waiting(String),
    /// Error, timeout, or no status; consumes an attempt.
    Unresolved(String),
}

pub struct VerificationScheduler {
    queue: Arc<dyn VerificationQueue>,
    documents: Arc<dyn DocumentStore>,
    checker: Arc<dyn IngestionStatusChecker>,
    trigger: Arc<dyn JobTrigger>,
    settings: SchedulerSettings,
    enabled: AtomicBool,
    worker_id: String,
}

/// `<HOSTNAME or "worker">-<uuid>`, unique per process.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, Uuid::new_v4())
}

impl VerificationScheduler {
    pub fn new(
        queue: Arc<dyn VerificationQueue>,
        documents: Arc<dyn DocumentStore>,
        checker: Arc<dyn IngestionStatusChecker>,
        trigger: Arc<dyn JobTrigger>,
        settings: SchedulerSettings,
        worker_id: String,
    ) -> Self {
        Self {
            queue,
            documents,
            checker,
            trigger,
            enabled: AtomicBool::new(settings.enabled),
            settings,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Takes effect at the start of the next poll.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Runs one poll at `now`.
    ///
    /// Fails only when claiming or saving fails; errors for individual
    /// tasks are recorded on the task and logged.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();
        if !self.is_enabled() || self.settings.batch_size == 0 {
            return Ok(report);
        }

        let claimed = self
            .queue
            .claim(
                &self.worker_id,
                self.settings.batch_size,
                self.settings.lock_ttl,
                now,
            )
            .await?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut ingested: Vec<(String, String)> = Vec::new();
        let mut mutated = Vec::with_capacity(claimed.len());

        for mut task in claimed {
            let outcome = self.check(&task).await;
            match outcome {
                CheckOutcome::Ingested(status) => {
                    task.last_status = Some(status);
                    task.last_status_ts = Some(now);
                    match self.mark_ingested(&task, now).await {
                        Ok(()) => {
                            task.status = VerificationStatus::Succeeded;
                            task.last_reason = None;
                            task.updated_at = now;
                            ingested.push((task.id.clone(), task.case_id.clone()));
                            report.succeeded += 1;
                            tracing::info!(
                                task_id = %task.id,
                                doc_id = %task.doc_id,
                                case_id = %task.case_id,
                                "document ingested"
                            );
                        }
                        Err(e) => {
                            let reason = format!("{:#}", e);
                            self.record_unresolved(&mut task, &reason, now, &mut report);
                        }
                    }
                }
                CheckOutcome::Waiting(status) => {
                    tracing::debug!(task_id = %task.id, status = %status, "ingestion still pending");
                    task.last_status = Some(status);
                    task.last_status_ts = Some(now);
                    task.status = VerificationStatus::InProgress;
                    task.next_attempt_at = now + self.settings.retry_delay;
                    task.updated_at = now;
                    report.retried += 1;
                }
                CheckOutcome::Unresolved(reason) => {
                    self.record_unresolved(&mut task, &reason, now, &mut report);
                }
            }
            mutated.push(task);
        }

        let written: HashSet<String> = self.queue.save(&mutated).await?.into_iter().collect();
        if written.len() < mutated.len() {
            tracing::warn!(
                worker = %self.worker_id,
                lost = mutated.len() - written.len(),
                "lease lost before save; another worker owns those tasks now"
            );
        }

        // Cases whose success was not saved are triggered by the new lease owner.
        let ready_cases: BTreeSet<String> = ingested
            .into_iter()
            .filter_map(|(task_id, case_id)| {
                if written.contains(&task_id) {
                    Some(case_id)
                } else {
                    tracing::info!(task_id = %task_id, case_id = %case_id, "skipping trigger for unsaved task");
                    None
                }
            })
            .collect();
        report.ready_case_ids = ready_cases.into_iter().collect();
        if self.settings.trigger_answer_job_on_success && !report.ready_case_ids.is_empty() {
            report.trigger_run_id = self.trigger_ready(&report.ready_case_ids).await;
        }

        Ok(report)
    }

    async fn check(&self, task: &VerificationTask) -> CheckOutcome {
        let call = self.checker.check(&task.blob_name);
        match tokio::time::timeout(self.settings.status_timeout, call).await {
            Err(_) => CheckOutcome::Unresolved(format!(
                "status check timed out after {}ms",
                self.settings.status_timeout.as_millis()
            )),
            Ok(Err(e)) => CheckOutcome::Unresolved(format!("status check failed: {:#}", e)),
            Ok(Ok(None)) => CheckOutcome::Unresolved("no ingestion status yet".to_string()),
            Ok(Ok(Some(status))) if status.is_success() => CheckOutcome::Ingested(status.status),
            Ok(Ok(Some(status))) => CheckOutcome::Waiting(status.status),
        }
    }

    async fn mark_ingested(&self, task: &VerificationTask, now: DateTime<Utc>) -> Result<()> {
        let found = self
            .documents
            .set_phase(&task.doc_id, IngestionPhase::Ingested, now)
            .await?;
        if !found {
            anyhow::bail!("document {} not found", task.doc_id);
        }
        Ok(())
    }

    fn record_unresolved(
        &self,
        task: &mut VerificationTask,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) {
        if task.record_failed_attempt(reason, now) {
            report.failed += 1;
            tracing::warn!(
                task_id = %task.id,
                doc_id = %task.doc_id,
                case_id = %task.case_id,
                attempts = task.attempt_count,
                reason,
                "verification attempts exhausted"
            );
        } else {
            task.next_attempt_at = now + self.settings.retry_delay;
            report.retried += 1;
            tracing::debug!(
                task_id = %task.id,
                attempts = task.attempt_count,
                max_attempts = task.max_attempts,
                reason,
                "verification attempt unresolved"
            );
        }
    }

    /// Starts the answer job for `case_ids` under a fresh trigger id.
    /// A failed start is logged; the poll's task updates stand.
    async fn trigger_ready(&self, case_ids: &[String]) -> Option<String> {
        let params = JobParameters::new()
            .identifying(PARAM_TRIGGER_ID, Uuid::new_v4().to_string())
            .identifying(PARAM_CASE_IDS, case_ids.join(","));
        match self
            .trigger
            .start(&self.settings.answer_job_name, params)
            .await
        {
            Ok(handle) => {
                tracing::info!(
                    job = %handle.job_name,
                    run_id = %handle.run_id,
                    cases = case_ids.len(),
                    "triggered downstream job"
                );
                Some(handle.run_id)
            }
            Err(e) => {
                tracing::error!(
                    job = %self.settings.answer_job_name,
                    error = %format!("{:#}", e),
                    "failed to trigger downstream job"
                );
                None
            }
        }
    }

    /// Fixed-delay poll loop. Returns once `shutdown` turns `true` (or its
    /// sender is dropped); an in-flight poll always completes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker = %self.worker_id,
            delay_ms = self.settings.delay.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "verification scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once(Utc::now()).await {
                Ok(report) if report.claimed > 0 => tracing::info!(
                    claimed = report.claimed,
                    succeeded = report.succeeded,
                    retried = report.retried,
                    failed = report.failed,
                    "verification poll"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %format!("{:#}", e), "verification poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker = %self.worker_id, "verification scheduler stopped");
    }
}
