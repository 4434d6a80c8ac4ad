//! Answer generation job.
//!
//! Started by the verification scheduler with the case ids that became
//! ready. Fans out over the latest `INGESTED` document per material (and per
//! configured query) and asks the answer service for each.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use case_ingest_core::execution::{ExecutionRecord, PARAM_CASE_IDS};
use case_ingest_core::partition::{Partitioner, ReadyDocumentPartitioner};
use case_ingest_core::store::DocumentStore;

use crate::fanout::run_partitions;
use crate::traits::{AnswerGenerator, Task};

pub const ANSWER_GENERATION_JOB: &str = "answer_generation";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnswerReport {
    pub partitions: usize,
    pub generated: usize,
    pub failed: usize,
}

pub struct AnswerGenerationTask {
    documents: Arc<dyn DocumentStore>,
    generator: Arc<dyn AnswerGenerator>,
    query_ids: Vec<String>,
    concurrency: usize,
    grid_size: usize,
}

impl AnswerGenerationTask {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        generator: Arc<dyn AnswerGenerator>,
        query_ids: Vec<String>,
        concurrency: usize,
        grid_size: usize,
    ) -> Self {
        Self {
            documents,
            generator,
            query_ids,
            concurrency,
            grid_size,
        }
    }
}

#[async_trait]
impl Task for AnswerGenerationTask {
    fn name(&self) -> &str {
        ANSWER_GENERATION_JOB
    }

    /// Without `caseIds` every ready document is processed.
    async fn execute(&self, record: &ExecutionRecord) -> Result<Value> {
        let mut partitioner = ReadyDocumentPartitioner::new(self.documents.clone())
            .with_query_ids(self.query_ids.clone());
        let case_ids = record.parameters.list(PARAM_CASE_IDS);
        if !case_ids.is_empty() {
            partitioner = partitioner.with_case_filter(case_ids);
        }
        let partitions = partitioner.partition(self.grid_size).await?;

        let mut report = AnswerReport {
            partitions: partitions.len(),
            ..Default::default()
        };

        let generator = self.generator.clone();
        let results = run_partitions(partitions, self.concurrency, move |_key, item| {
            let generator = generator.clone();
            async move {
                let doc_id = item.document_id.unwrap_or_default();
                generator
                    .generate(&item.case_id, &doc_id, item.query_id.as_deref())
                    .await
            }
        })
        .await;

        for result in results.values() {
            match result {
                Ok(()) => report.generated += 1,
                Err(_) => report.failed += 1,
            }
        }
        if report.partitions > 0 && report.generated == 0 {
            bail!("answer generation failed for all {} partitions", report.partitions);
        }

        tracing::info!(
            run_id = %record.run_id,
            partitions = report.partitions,
            generated = report.generated,
            failed = report.failed,
            "answer generation finished"
        );
        Ok(serde_json::to_value(&report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use case_ingest_core::execution::JobParameters;
    use case_ingest_core::models::{Document, IngestionPhase};
    use case_ingest_core::store::memory::InMemoryStore;
    use chrono::Utc;
    use std::sync::Mutex;

    const CASE_A: &str = "0b8f5a2e-3c1d-4e6f-8a9b-0c1d2e3f4a01";
    const CASE_B: &str = "0b8f5a2e-3c1d-4e6f-8a9b-0c1d2e3f4a02";

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    #[async_trait]
    impl AnswerGenerator for Recorder {
        async fn generate(&self, case_id: &str, doc_id: &str, query_id: Option<&str>) -> Result<()> {
            self.calls.lock().unwrap().push((
                case_id.to_string(),
                doc_id.to_string(),
                query_id.map(str::to_string),
            ));
            Ok(())
        }
    }

    async fn seed(store: &InMemoryStore, doc_id: &str, case_id: &str) {
        let mut doc = Document::waiting_for_upload(doc_id, case_id, doc_id, "progression", doc_id, Utc::now());
        doc.ingestion_phase = IngestionPhase::Ingested;
        store.upsert_document(&doc).await.unwrap();
    }

    fn record(cases: Option<&str>) -> ExecutionRecord {
        let params = match cases {
            Some(c) => JobParameters::new().identifying(PARAM_CASE_IDS, c),
            None => JobParameters::new(),
        };
        ExecutionRecord::new(ANSWER_GENERATION_JOB, "run-1", params)
    }

    #[tokio::test]
    async fn only_triggered_cases_are_processed() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "d-a", CASE_A).await;
        seed(&store, "d-b", CASE_B).await;
        let recorder = Arc::new(Recorder::default());
        let task = AnswerGenerationTask::new(store.clone(), recorder.clone(), Vec::new(), 2, 2);

        let out = task.execute(&record(Some(CASE_A))).await.unwrap();
        assert_eq!(out["generated"], 1);
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(CASE_A.to_string(), "d-a".to_string(), None)]);
    }

    #[tokio::test]
    async fn each_query_gets_its_own_call() {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, "d-a", CASE_A).await;
        let recorder = Arc::new(Recorder::default());
        let task = AnswerGenerationTask::new(
            store.clone(),
            recorder.clone(),
            vec!["summary".to_string(), "charges".to_string()],
            2,
            2,
        );
        let out = task.execute(&record(None)).await.unwrap();
        assert_eq!(out["partitions"], 2);
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn nothing_ready_is_not_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let task = AnswerGenerationTask::new(store, Arc::new(Recorder::default()), Vec::new(), 1, 1);
        let out = task.execute(&record(Some(CASE_A))).await.unwrap();
        assert_eq!(out["partitions"], 0);
    }
}
