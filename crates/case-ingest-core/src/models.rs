//! Core data models shared by the ingestion pipeline and the verification
//! scheduler.
//!
//! These types represent the case documents, their ingestion phase, the
//! verification tasks that confirm ingestion, and the ephemeral records that
//! flow between the partitioner, parallel workers, and the aggregator.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of a document, from discovery through confirmed ingestion.
///
/// The variants are declared in pipeline order so that `Ord` follows the
/// forward direction of the lifecycle. `Failed` sits outside that order and
/// is reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionPhase {
    NotFound,
    WaitingForUpload,
    Uploading,
    Uploaded,
    Ingesting,
    Ingested,
    Failed,
}

/// Phases in which a document already "owns" its `(case, material)` pair.
///
/// The identity resolver reuses a document in one of these phases instead of
/// minting a new id.
pub const CLAIMED_PHASES: [IngestionPhase; 3] = [
    IngestionPhase::Uploaded,
    IngestionPhase::Ingested,
    IngestionPhase::WaitingForUpload,
];

impl IngestionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionPhase::NotFound => "NOT_FOUND",
            IngestionPhase::WaitingForUpload => "WAITING_FOR_UPLOAD",
            IngestionPhase::Uploading => "UPLOADING",
            IngestionPhase::Uploaded => "UPLOADED",
            IngestionPhase::Ingesting => "INGESTING",
            IngestionPhase::Ingested => "INGESTED",
            IngestionPhase::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionPhase::Ingested | IngestionPhase::Failed)
    }

    pub fn is_claimed(&self) -> bool {
        CLAIMED_PHASES.contains(self)
    }

    /// Whether a document in this phase may move to `next`.
    ///
    /// Forward moves may skip intermediate phases (the status service can
    /// report `INGESTED` for a document we last saw as `UPLOADED`). Terminal
    /// phases never move.
    pub fn can_transition_to(&self, next: IngestionPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == IngestionPhase::Failed || next > *self
    }
}

impl fmt::Display for IngestionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_FOUND" => Ok(IngestionPhase::NotFound),
            "WAITING_FOR_UPLOAD" => Ok(IngestionPhase::WaitingForUpload),
            "UPLOADING" => Ok(IngestionPhase::Uploading),
            "UPLOADED" => Ok(IngestionPhase::Uploaded),
            "INGESTING" => Ok(IngestionPhase::Ingesting),
            "INGESTED" => Ok(IngestionPhase::Ingested),
            "FAILED" => Ok(IngestionPhase::Failed),
            other => Err(anyhow!("unknown ingestion phase: '{}'", other)),
        }
    }
}

/// One ingested case document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub case_id: String,
    /// Identifier of the material in the source system.
    pub material_id: String,
    /// Source system tag (e.g. `"progression"`).
    pub source: String,
    pub doc_name: String,
    /// Name the ingestion-status service knows the uploaded blob by.
    pub blob_name: Option<String>,
    pub blob_uri: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub ingestion_phase: IngestionPhase,
    pub ingestion_phase_at: DateTime<Utc>,
}

impl Document {
    /// A freshly resolved document that has not been uploaded yet.
    pub fn waiting_for_upload(
        doc_id: &str,
        case_id: &str,
        material_id: &str,
        source: &str,
        doc_name: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            case_id: case_id.to_string(),
            material_id: material_id.to_string(),
            source: source.to_string(),
            doc_name: doc_name.to_string(),
            blob_name: None,
            blob_uri: None,
            content_type: None,
            size_bytes: None,
            checksum: None,
            ingestion_phase: IngestionPhase::WaitingForUpload,
            ingestion_phase_at: now,
        }
    }
}

/// Status of a verification task.
///
/// `Pending` is never stored by a claim; the absence of a lock on a
/// non-terminal task is what makes it available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::InProgress => "IN_PROGRESS",
            VerificationStatus::Succeeded => "SUCCEEDED",
            VerificationStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Succeeded | VerificationStatus::Failed
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(VerificationStatus::Pending),
            "IN_PROGRESS" => Ok(VerificationStatus::InProgress),
            "SUCCEEDED" => Ok(VerificationStatus::Succeeded),
            "FAILED" => Ok(VerificationStatus::Failed),
            other => Err(anyhow!("unknown verification status: '{}'", other)),
        }
    }
}

/// One outstanding request to confirm a document's ingestion status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationTask {
    pub id: String,
    pub doc_id: String,
    pub case_id: String,
    pub blob_name: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: VerificationStatus,
    pub last_status: Option<String>,
    pub last_reason: Option<String>,
    pub last_status_ts: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationTask {
    /// Whether `owner` may claim this task at `now` under a lease of `lock_ttl`.
    ///
    /// Stores must express the same predicate inside their atomic claim.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_ttl: chrono::Duration) -> bool {
        if self.status.is_terminal() || self.next_attempt_at > now {
            return false;
        }
        match (&self.lock_owner, self.lock_acquired_at) {
            (None, _) | (Some(_), None) => true,
            (Some(_), Some(acquired)) => acquired + lock_ttl <= now,
        }
    }

    /// Records a failed or empty check. Returns `true` when the attempt
    /// budget is exhausted and the task moved to `Failed`.
    pub fn record_failed_attempt(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_reason = Some(reason.to_string());
        self.last_status_ts = Some(now);
        self.updated_at = now;
        if self.attempt_count > self.max_attempts {
            self.status = VerificationStatus::Failed;
            true
        } else {
            self.status = VerificationStatus::InProgress;
            false
        }
    }
}

/// Input to [`VerificationQueue::enqueue`](crate::store::VerificationQueue::enqueue).
#[derive(Debug, Clone)]
pub struct NewVerificationTask {
    pub doc_id: String,
    pub case_id: String,
    pub blob_name: String,
    pub max_attempts: u32,
}

/// Status body returned by the external ingestion-status service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatus {
    pub status: String,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Status value the ingestion service reports once a blob is indexed.
pub const INGESTION_SUCCESS: &str = "INGESTION_SUCCESS";

impl IngestionStatus {
    pub fn is_success(&self) -> bool {
        self.status == INGESTION_SUCCESS
    }
}

/// A material as reported by the case-progression source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Material {
    pub material_id: String,
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub source_uri: Option<String>,
}

/// One unit of work handed to a parallel worker.
///
/// Carries only the context needed to process the unit in isolation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWorkItem {
    pub case_id: String,
    pub material_id: Option<String>,
    pub material_name: Option<String>,
    pub document_id: Option<String>,
    pub query_id: Option<String>,
}

impl PartitionWorkItem {
    pub fn for_case(case_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            ..Default::default()
        }
    }
}

/// What a fan-out worker hands back for the aggregator to merge.
///
/// Fields are optional because workers report what they found; the
/// aggregator decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResult {
    pub case_id: Option<String>,
    pub material_id: Option<String>,
    pub material_name: Option<String>,
}

/// Per-(case, material) identity decision produced by the aggregator.
///
/// Exactly one of `existing_doc_id` / `new_doc_id` is set, and
/// `resolved_doc_id` always equals it. Construct through [`reused`] or
/// [`minted`] to keep that true.
///
/// [`reused`]: MaterialDocumentMapping::reused
/// [`minted`]: MaterialDocumentMapping::minted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDocumentMapping {
    pub material_id: String,
    pub material_name: String,
    pub case_id: String,
    pub resolved_doc_id: String,
    pub existing_doc_id: Option<String>,
    pub new_doc_id: Option<String>,
}

impl MaterialDocumentMapping {
    pub fn reused(case_id: &str, material_id: &str, material_name: &str, doc_id: String) -> Self {
        Self {
            material_id: material_id.to_string(),
            material_name: material_name.to_string(),
            case_id: case_id.to_string(),
            resolved_doc_id: doc_id.clone(),
            existing_doc_id: Some(doc_id),
            new_doc_id: None,
        }
    }

    pub fn minted(case_id: &str, material_id: &str, material_name: &str, doc_id: String) -> Self {
        Self {
            material_id: material_id.to_string(),
            material_name: material_name.to_string(),
            case_id: case_id.to_string(),
            resolved_doc_id: doc_id.clone(),
            existing_doc_id: None,
            new_doc_id: Some(doc_id),
        }
    }

    pub fn is_reused(&self) -> bool {
        self.existing_doc_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(now: DateTime<Utc>) -> VerificationTask {
        VerificationTask {
            id: "t1".to_string(),
            doc_id: "d1".to_string(),
            case_id: "c1".to_string(),
            blob_name: "b1".to_string(),
            attempt_count: 0,
            max_attempts: 3,
            status: VerificationStatus::Pending,
            last_status: None,
            last_reason: None,
            last_status_ts: None,
            next_attempt_at: now,
            lock_owner: None,
            lock_acquired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn phase_names_round_trip_through_from_str() {
        for phase in [
            IngestionPhase::NotFound,
            IngestionPhase::WaitingForUpload,
            IngestionPhase::Uploaded,
            IngestionPhase::Ingested,
            IngestionPhase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<IngestionPhase>().unwrap(), phase);
        }
        assert!("DONE".parse::<IngestionPhase>().is_err());
    }

    #[test]
    fn phase_transitions_only_move_forward() {
        use IngestionPhase::*;
        assert!(WaitingForUpload.can_transition_to(Uploading));
        assert!(Uploaded.can_transition_to(Ingested));
        assert!(Uploading.can_transition_to(Failed));
        assert!(!Uploaded.can_transition_to(WaitingForUpload));
        assert!(!Ingested.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Uploaded));
    }

    #[test]
    fn claimed_phases() {
        assert!(IngestionPhase::Uploaded.is_claimed());
        assert!(IngestionPhase::WaitingForUpload.is_claimed());
        assert!(!IngestionPhase::Uploading.is_claimed());
        assert!(!IngestionPhase::Failed.is_claimed());
    }

    #[test]
    fn expired_lock_is_claimable() {
        let now = Utc::now();
        let ttl = Duration::milliseconds(1_000);
        let mut t = task(now);
        assert!(t.is_claimable(now, ttl));

        t.lock_owner = Some("worker-a".to_string());
        t.lock_acquired_at = Some(now - Duration::milliseconds(500));
        assert!(!t.is_claimable(now, ttl));

        t.lock_acquired_at = Some(now - Duration::milliseconds(1_500));
        assert!(t.is_claimable(now, ttl));
    }

    #[test]
    fn terminal_and_deferred_tasks_are_not_claimable() {
        let now = Utc::now();
        let ttl = Duration::seconds(60);
        let mut t = task(now);
        t.next_attempt_at = now + Duration::seconds(5);
        assert!(!t.is_claimable(now, ttl));

        let mut done = task(now);
        done.status = VerificationStatus::Succeeded;
        assert!(!done.is_claimable(now, ttl));
    }

    #[test]
    fn attempts_beyond_budget_fail_the_task() {
        let now = Utc::now();
        let mut t = task(now);
        assert!(!t.record_failed_attempt("timeout", now));
        assert!(!t.record_failed_attempt("timeout", now));
        assert!(!t.record_failed_attempt("timeout", now));
        assert_eq!(t.status, VerificationStatus::InProgress);
        assert!(t.record_failed_attempt("timeout", now));
        assert_eq!(t.status, VerificationStatus::Failed);
        assert_eq!(t.attempt_count, 4);
    }

    #[test]
    fn mapping_constructors_set_exactly_one_id() {
        let reused = MaterialDocumentMapping::reused("c", "m", "name", "d1".to_string());
        assert_eq!(reused.existing_doc_id.as_deref(), Some("d1"));
        assert!(reused.new_doc_id.is_none());
        assert_eq!(reused.resolved_doc_id, "d1");

        let minted = MaterialDocumentMapping::minted("c", "m", "name", "d2".to_string());
        assert!(minted.existing_doc_id.is_none());
        assert_eq!(minted.new_doc_id.as_deref(), Some("d2"));
        assert_eq!(minted.resolved_doc_id, "d2");
    }

    #[test]
    fn ingestion_status_parses_camel_case() {
        let status: IngestionStatus =
            serde_json::from_str(r#"{"status":"INGESTION_SUCCESS","lastUpdated":"2024-01-01"}"#)
                .unwrap();
        assert!(status.is_success());
        assert_eq!(status.last_updated.as_deref(), Some("2024-01-01"));
    }
}
