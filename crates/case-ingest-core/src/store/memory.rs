//! In-memory [`DocumentStore`] and [`VerificationQueue`] for tests.
//!
//! Uses `HashMap` behind `std::sync::Mutex`. Claiming holds the task mutex
//! for the whole select-and-stamp, which gives the same at-most-one-claim
//! guarantee the SQLite backend gets from a single conditional `UPDATE`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{
    Document, IngestionPhase, NewVerificationTask, VerificationStatus, VerificationTask,
};

use super::{DocumentStore, VerificationQueue};

/// In-memory store for tests.
pub struct InMemoryStore {
    docs: Mutex<HashMap<String, Document>>,
    tasks: Mutex<HashMap<String, VerificationTask>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a task exactly as given, bypassing `enqueue` defaults.
    pub fn insert_task(&self, task: VerificationTask) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn document_count(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        self.docs
            .lock()
            .unwrap()
            .insert(doc.doc_id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self.docs.lock().unwrap().get(doc_id).cloned())
    }

    async fn find_latest_in_phases(
        &self,
        case_id: &str,
        material_id: &str,
        phases: &[IngestionPhase],
    ) -> Result<Option<Document>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .values()
            .filter(|d| {
                d.case_id == case_id
                    && d.material_id == material_id
                    && phases.contains(&d.ingestion_phase)
            })
            .max_by(|a, b| {
                a.ingestion_phase_at
                    .cmp(&b.ingestion_phase_at)
                    .then_with(|| a.doc_id.cmp(&b.doc_id))
            })
            .cloned())
    }

    async fn set_phase(
        &self,
        doc_id: &str,
        phase: IngestionPhase,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut docs = self.docs.lock().unwrap();
        let doc = match docs.get_mut(doc_id) {
            Some(d) => d,
            None => return Ok(false),
        };
        if doc.ingestion_phase != phase && !doc.ingestion_phase.can_transition_to(phase) {
            bail!(
                "document {} cannot move from {} to {}",
                doc_id,
                doc.ingestion_phase,
                phase
            );
        }
        doc.ingestion_phase = phase;
        doc.ingestion_phase_at = at;
        Ok(true)
    }

    async fn latest_in_phase(
        &self,
        phase: IngestionPhase,
        case_filter: Option<&[String]>,
    ) -> Result<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut latest: HashMap<(&str, &str), &Document> = HashMap::new();
        for doc in docs.values() {
            if let Some(filter) = case_filter {
                if !filter.iter().any(|c| c == &doc.case_id) {
                    continue;
                }
            }
            let key = (doc.case_id.as_str(), doc.material_id.as_str());
            let newer = latest.get(&key).map_or(true, |current| {
                (current.ingestion_phase_at, current.doc_id.as_str())
                    < (doc.ingestion_phase_at, doc.doc_id.as_str())
            });
            if newer {
                latest.insert(key, doc);
            }
        }
        let mut out: Vec<Document> = latest
            .into_values()
            .filter(|d| d.ingestion_phase == phase)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.case_id.as_str(), a.material_id.as_str())
                .cmp(&(b.case_id.as_str(), b.material_id.as_str()))
        });
        Ok(out)
    }
}

#[async_trait]
impl VerificationQueue for InMemoryStore {
    async fn enqueue(&self, new: NewVerificationTask) -> Result<VerificationTask> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks
            .values()
            .find(|t| t.doc_id == new.doc_id && !t.status.is_terminal())
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let task = VerificationTask {
            id: Uuid::new_v4().to_string(),
            doc_id: new.doc_id,
            case_id: new.case_id,
            blob_name: new.blob_name,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            status: VerificationStatus::Pending,
            last_status: None,
            last_reason: None,
            last_status_ts: None,
            next_attempt_at: now,
            lock_owner: None,
            lock_acquired_at: None,
            created_at: now,
            updated_at: now,
        };
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn claim(
        &self,
        owner: &str,
        batch_size: usize,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationTask>> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut eligible: Vec<&mut VerificationTask> = tasks
            .values_mut()
            .filter(|t| t.is_claimable(now, lock_ttl))
            .collect();
        eligible.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut claimed = Vec::new();
        for task in eligible.into_iter().take(batch_size) {
            task.lock_owner = Some(owner.to_string());
            task.lock_acquired_at = Some(now);
            task.status = VerificationStatus::InProgress;
            task.updated_at = now;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn save(&self, updates: &[VerificationTask]) -> Result<Vec<String>> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut written = Vec::new();
        for update in updates {
            let stored = match tasks.get_mut(&update.id) {
                Some(t) => t,
                None => continue,
            };
            if stored.lock_owner != update.lock_owner {
                continue;
            }
            let mut next = update.clone();
            next.lock_owner = None;
            next.lock_acquired_at = None;
            *stored = next;
            written.push(update.id.clone());
        }
        Ok(written)
    }

    async fn get(&self, id: &str) -> Result<Option<VerificationTask>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn list(&self, status: Option<VerificationStatus>) -> Result<Vec<VerificationTask>> {
        let tasks = self.tasks.lock().unwrap();
        let mut out: Vec<VerificationTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(t) if t.status == VerificationStatus::Failed => {
                t.status = VerificationStatus::Pending;
                t.attempt_count = 0;
                t.next_attempt_at = now;
                t.lock_owner = None;
                t.lock_acquired_at = None;
                t.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn doc(id: &str, case: &str, material: &str, phase: IngestionPhase, at_secs: i64) -> Document {
        let at = DateTime::from_timestamp(1_700_000_000 + at_secs, 0).unwrap();
        let mut d = Document::waiting_for_upload(id, case, material, "progression", "doc", at);
        d.ingestion_phase = phase;
        d
    }

    fn new_task(doc_id: &str) -> NewVerificationTask {
        NewVerificationTask {
            doc_id: doc_id.to_string(),
            case_id: "case-1".to_string(),
            blob_name: format!("{}.pdf", doc_id),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn latest_in_phase_takes_most_recent_row_per_material() {
        let store = InMemoryStore::new();
        store
            .upsert_document(&doc("old", "c1", "m1", IngestionPhase::Ingested, 0))
            .await
            .unwrap();
        store
            .upsert_document(&doc("new", "c1", "m1", IngestionPhase::Ingested, 10))
            .await
            .unwrap();
        store
            .upsert_document(&doc("other", "c1", "m2", IngestionPhase::Ingested, 5))
            .await
            .unwrap();
        // Newest row for m3 is not ingested, so m3 is not ready.
        store
            .upsert_document(&doc("m3-a", "c1", "m3", IngestionPhase::Ingested, 1))
            .await
            .unwrap();
        store
            .upsert_document(&doc("m3-b", "c1", "m3", IngestionPhase::Uploaded, 2))
            .await
            .unwrap();

        let ready = store
            .latest_in_phase(IngestionPhase::Ingested, None)
            .await
            .unwrap();
        let ids: Vec<&str> = ready.iter().map(|d| d.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "other"]);
    }

    #[tokio::test]
    async fn latest_in_phase_respects_case_filter() {
        let store = InMemoryStore::new();
        store
            .upsert_document(&doc("a", "c1", "m1", IngestionPhase::Ingested, 0))
            .await
            .unwrap();
        store
            .upsert_document(&doc("b", "c2", "m1", IngestionPhase::Ingested, 0))
            .await
            .unwrap();
        let filter = vec!["c2".to_string()];
        let ready = store
            .latest_in_phase(IngestionPhase::Ingested, Some(&filter))
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].doc_id, "b");
    }

    #[tokio::test]
    async fn set_phase_rejects_backwards_move() {
        let store = InMemoryStore::new();
        store
            .upsert_document(&doc("d", "c", "m", IngestionPhase::Ingested, 0))
            .await
            .unwrap();
        assert!(store
            .set_phase("d", IngestionPhase::Uploaded, Utc::now())
            .await
            .is_err());
        assert!(!store
            .set_phase("missing", IngestionPhase::Ingested, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_open_document() {
        let store = InMemoryStore::new();
        let first = store.enqueue(new_task("d1")).await.unwrap();
        let second = store.enqueue(new_task("d1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..10 {
            store.enqueue(new_task(&format!("d{}", i))).await.unwrap();
        }
        let now = Utc::now() + Duration::seconds(1);
        let ttl = Duration::seconds(60);

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(&format!("worker-{}", w), 10, ttl, now)
                    .await
                    .unwrap()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for h in handles {
            for task in h.await.unwrap() {
                assert!(seen.insert(task.id), "task claimed twice");
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn save_from_stale_owner_is_dropped() {
        let store = InMemoryStore::new();
        store.enqueue(new_task("d1")).await.unwrap();
        let t0 = Utc::now() + Duration::seconds(1);
        let ttl = Duration::seconds(10);

        let mut stale = store.claim("a", 1, ttl, t0).await.unwrap().remove(0);
        let taken = store
            .claim("b", 1, ttl, t0 + Duration::seconds(11))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        stale.attempt_count = 2;
        assert!(store.save(&[stale.clone()]).await.unwrap().is_empty());
        assert_eq!(store.get(&stale.id).await.unwrap().unwrap().attempt_count, 0);

        assert_eq!(store.save(&taken).await.unwrap(), vec![stale.id.clone()]);
        let saved = store.get(&stale.id).await.unwrap().unwrap();
        assert!(saved.lock_owner.is_none());
    }

    #[tokio::test]
    async fn requeue_only_resets_failed_tasks() {
        let store = InMemoryStore::new();
        let task = store.enqueue(new_task("d1")).await.unwrap();
        assert!(!store.requeue_failed(&task.id, Utc::now()).await.unwrap());

        let mut failed = task.clone();
        failed.status = VerificationStatus::Failed;
        failed.attempt_count = 4;
        store.insert_task(failed);
        assert!(store.requeue_failed(&task.id, Utc::now()).await.unwrap());
        let t = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(t.status, VerificationStatus::Pending);
        assert_eq!(t.attempt_count, 0);
    }
}
