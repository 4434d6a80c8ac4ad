//! Storage abstraction for Case Ingest.
//!
//! Two traits cover the shared state of the system: the [`DocumentStore`]
//! holding every ingested document and its phase, and the
//! [`VerificationQueue`] of outstanding ingestion checks. Backends are
//! pluggable (SQLite in the application crate, [`memory::InMemoryStore`]
//! for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::{
    Document, IngestionPhase, NewVerificationTask, VerificationStatus, VerificationTask,
};

/// Persistent record of every case document.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](DocumentStore::upsert_document) | Insert or replace a document by id |
/// | [`get_document`](DocumentStore::get_document) | Fetch one document |
/// | [`find_latest_in_phases`](DocumentStore::find_latest_in_phases) | Identity lookup for a (case, material) pair |
/// | [`set_phase`](DocumentStore::set_phase) | Apply a phase transition |
/// | [`latest_in_phase`](DocumentStore::latest_in_phase) | Readiness query |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Most recently transitioned document for `(case_id, material_id)`
    /// whose phase is one of `phases`. `Ok(None)` when nothing matches.
    async fn find_latest_in_phases(
        &self,
        case_id: &str,
        material_id: &str,
        phases: &[IngestionPhase],
    ) -> Result<Option<Document>>;

    /// Moves a document to `phase`. Returns `false` when the document does
    /// not exist; errors when the transition is not allowed.
    async fn set_phase(&self, doc_id: &str, phase: IngestionPhase, at: DateTime<Utc>)
        -> Result<bool>;

    /// For each `(case_id, material_id)`, takes the most recently
    /// transitioned row and keeps it if its phase equals `phase`.
    /// `case_filter` restricts the result to the given case ids.
    async fn latest_in_phase(
        &self,
        phase: IngestionPhase,
        case_filter: Option<&[String]>,
    ) -> Result<Vec<Document>>;
}

/// Durable queue of verification tasks with lease-based claiming.
#[async_trait]
pub trait VerificationQueue: Send + Sync {
    /// Adds a task for a document. If the document already has a
    /// non-terminal task, that task is returned unchanged.
    async fn enqueue(&self, task: NewVerificationTask) -> Result<VerificationTask>;

    /// Atomically claims up to `batch_size` claimable tasks for `owner`.
    ///
    /// A task is claimable when its status is not terminal, its lock is
    /// absent or older than `lock_ttl`, and `next_attempt_at <= now`.
    /// Claimed tasks come back with `lock_owner = owner`,
    /// `lock_acquired_at = now`, `status = IN_PROGRESS`. Two concurrent
    /// claims never return the same task.
    async fn claim(
        &self,
        owner: &str,
        batch_size: usize,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationTask>>;

    /// Persists the given tasks and releases their locks, so non-terminal
    /// tasks become claimable again at `next_attempt_at`.
    ///
    /// A row is only written while its stored `lock_owner` still equals the
    /// task's `lock_owner`; a worker whose lease was taken over loses its
    /// write. Returns the ids of the rows actually written.
    async fn save(&self, tasks: &[VerificationTask]) -> Result<Vec<String>>;

    async fn get(&self, id: &str) -> Result<Option<VerificationTask>>;

    async fn list(&self, status: Option<VerificationStatus>) -> Result<Vec<VerificationTask>>;

    /// Resets a `FAILED` task back to `PENDING` with zero attempts.
    /// Returns `false` if the task is missing or not failed.
    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;
}
