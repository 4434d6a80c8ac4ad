//! Read-side commands: queue listing, manual requeue, readiness.
//!
//! Used by `caseingest tasks`, `caseingest requeue`, and `caseingest ready`
//! to inspect what the scheduler is doing without touching its leases.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use case_ingest_core::models::{IngestionPhase, VerificationStatus};
use case_ingest_core::store::{DocumentStore, VerificationQueue};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteStore::new(pool))
}

/// Print verification tasks, optionally filtered by status.
pub async fn run_tasks(config: &Config, status: Option<String>) -> Result<()> {
    let status = status
        .map(|s| s.to_uppercase().parse::<VerificationStatus>())
        .transpose()?;
    let store = open_store(config).await?;
    let tasks = store.list(status).await?;

    if tasks.is_empty() {
        println!("No verification tasks.");
        store.pool().close().await;
        return Ok(());
    }

    println!(
        "{:<36}  {:<11}  {:>8}  {:<20}  {}",
        "TASK", "STATUS", "ATTEMPTS", "LAST STATUS", "NEXT ATTEMPT"
    );
    println!("{}", "-".repeat(100));
    for task in &tasks {
        let next = if task.status.is_terminal() {
            "-".to_string()
        } else {
            format_relative(task.next_attempt_at)
        };
        println!(
            "{:<36}  {:<11}  {:>3} / {:<2}  {:<20}  {}",
            task.id,
            task.status.as_str(),
            task.attempt_count,
            task.max_attempts,
            task.last_status.as_deref().unwrap_or("-"),
            next
        );
        if let Some(reason) = &task.last_reason {
            if task.status == VerificationStatus::Failed {
                println!("    reason: {}", reason);
            }
        }
    }
    println!();
    println!("{} task(s)", tasks.len());

    store.pool().close().await;
    Ok(())
}

/// Return a `FAILED` task to `PENDING` with a fresh attempt budget.
pub async fn run_requeue(config: &Config, task_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let requeued = store.requeue_failed(task_id, Utc::now()).await?;
    store.pool().close().await;

    if !requeued {
        bail!("task {} not found or not FAILED", task_id);
    }
    println!("Requeued {}", task_id);
    Ok(())
}

/// Print the documents the answer job would pick up.
pub async fn run_ready(config: &Config, case_ids: Vec<String>) -> Result<()> {
    let store = open_store(config).await?;
    let filter = if case_ids.is_empty() {
        None
    } else {
        Some(case_ingest_core::partition::valid_case_ids(&case_ids))
    };
    let docs = store
        .latest_in_phase(IngestionPhase::Ingested, filter.as_deref())
        .await?;
    store.pool().close().await;

    if docs.is_empty() {
        println!("No ready documents.");
        return Ok(());
    }
    println!("{:<36}  {:<36}  {:<24}  {}", "CASE", "DOCUMENT", "NAME", "INGESTED");
    println!("{}", "-".repeat(120));
    for doc in &docs {
        println!(
            "{:<36}  {:<36}  {:<24}  {}",
            doc.case_id,
            doc.doc_id,
            doc.doc_name,
            format_relative(doc.ingestion_phase_at)
        );
    }
    Ok(())
}

/// "in 5 mins", "3 hours ago", or an ISO timestamp beyond a month.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(ts).num_seconds();
    let (magnitude, future) = if delta < 0 { (-delta, true) } else { (delta, false) };

    let unit = if magnitude < 60 {
        return if future { "soon".to_string() } else { "just now".to_string() };
    } else if magnitude < 3600 {
        (magnitude / 60, "min")
    } else if magnitude < 86400 {
        (magnitude / 3600, "hour")
    } else if magnitude < 86400 * 30 {
        (magnitude / 86400, "day")
    } else {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    };

    let plural = if unit.0 == 1 { "" } else { "s" };
    if future {
        format!("in {} {}{}", unit.0, unit.1, plural)
    } else {
        format!("{} {}{} ago", unit.0, unit.1, plural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_times() {
        let now = Utc::now();
        assert_eq!(format_relative(now), "just now");
        assert_eq!(format_relative(now - chrono::Duration::minutes(5)), "5 mins ago");
        assert_eq!(format_relative(now - chrono::Duration::hours(1)), "1 hour ago");
        assert!(format_relative(now + chrono::Duration::hours(2) + chrono::Duration::seconds(30))
            .starts_with("in 2 hour"));
        assert_eq!(format_relative(now + chrono::Duration::seconds(10)), "soon");
    }
}
